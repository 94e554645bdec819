use std::{collections::BTreeMap, sync::Arc};

use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    filter::{want, want_field},
    inventory::{Vnic, VnicMap, parse_vnics},
    kstat::{KstatReader, KstatSelector, NamedStat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
};

use crate::{Config, DLADM_BINARY};

/// Tags of a `net` point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTags {
    pub zone: String,
    /// The physical link under the VNIC, or `none`.
    pub link: String,
    /// Like `1000mbit`, or `unknown`.
    pub speed: String,
    pub name: String,
}

/// Attributes a datalink to a zone.
///
/// A link that is not a VNIC, or that is a VNIC of the current zone, is described as
/// belonging to the current zone, without any physical link or speed.
pub fn link_tags(link: &str, vnic: Option<&Vnic>, current_zone: &str) -> LinkTags {
    match vnic {
        Some(vnic) if vnic.zone != current_zone => LinkTags {
            zone: vnic.zone.clone(),
            link: vnic.link.clone(),
            speed: format!("{}mbit", vnic.speed),
            name: vnic.name.clone(),
        },
        _ => LinkTags {
            zone: current_zone.to_owned(),
            link: String::from("none"),
            speed: String::from("unknown"),
            name: link.to_owned(),
        },
    }
}

/// Reports the statistics of each datalink.
pub struct NetworkSource {
    config: Config,
    current_zone: String,
    runner: Arc<dyn CommandRunner>,
    kstat: Arc<dyn KstatReader>,
}

impl NetworkSource {
    pub fn new(
        config: Config,
        current_zone: String,
        runner: Arc<dyn CommandRunner>,
        kstat: Arc<dyn KstatReader>,
    ) -> Self {
        Self {
            config,
            current_zone,
            runner,
            kstat,
        }
    }

    fn vnics(&self) -> VnicMap {
        // without the vnics, every link is attributed to the current zone
        match stdout_of(self.runner.as_ref(), DLADM_BINARY, &["show-vnic", "-po", "link,zone,over,speed"]) {
            Ok(output) => parse_vnics(&output),
            Err(e) => {
                log::warn!("could not list the vnics: {e:#}");
                VnicMap::default()
            }
        }
    }
}

impl Source for NetworkSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("link")).retry_poll()?;
        let vnics = self.vnics();

        let mut links: BTreeMap<&str, Vec<&NamedStat>> = BTreeMap::new();
        for stat in stats.iter().filter(|s| want(&s.name, &self.config.vnics)) {
            links.entry(stat.name.as_str()).or_default().push(stat);
        }

        for (link, stats) in links {
            let tags = link_tags(link, vnics.get(link), &self.current_zone);
            if !want(&tags.zone, &self.config.zones) {
                continue;
            }
            let mut point = MeasurementPoint::new(timestamp, "net")
                .with_tag("zone", tags.zone)
                .with_tag("link", tags.link)
                .with_tag("speed", tags.speed)
                .with_tag("name", tags.name);
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.config.fields)) {
                if let Some(value) = stat.value.as_f64() {
                    point.add_field(stat.statistic.clone(), value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vnic(name: &str, zone: &str) -> Vnic {
        Vnic {
            name: name.to_owned(),
            zone: zone.to_owned(),
            link: String::from("rge0"),
            speed: 1000,
        }
    }

    #[test]
    fn vnic_of_another_zone() {
        let v = vnic("dns_net0", "dns");
        assert_eq!(
            link_tags("dns_net0", Some(&v), "global"),
            LinkTags {
                zone: String::from("dns"),
                link: String::from("rge0"),
                speed: String::from("1000mbit"),
                name: String::from("dns_net0"),
            }
        );
    }

    #[test]
    fn physical_link_or_local_vnic() {
        let expected = LinkTags {
            zone: String::from("global"),
            link: String::from("none"),
            speed: String::from("unknown"),
            name: String::from("rge0"),
        };
        assert_eq!(link_tags("rge0", None, "global"), expected);
        let v = vnic("rge0", "global");
        assert_eq!(link_tags("rge0", Some(&v), "global"), expected);
    }
}
