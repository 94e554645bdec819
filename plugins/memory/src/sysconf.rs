//! System configuration values.

use anyhow::Context;

fn sysconf(name: &str, arg: libc::c_int) -> anyhow::Result<u64> {
    let r = unsafe { libc::sysconf(arg) };
    if r == -1 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("sysconf failed for {name}"));
    }
    u64::try_from(r).with_context(|| format!("invalid {name}: {r}"))
}

/// Returns the size of a memory page, in bytes.
pub fn page_size() -> anyhow::Result<u64> {
    sysconf("the page size", libc::_SC_PAGESIZE)
}
