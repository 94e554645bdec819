use std::sync::Arc;

use illumos_metrics::{
    agent::{self, PluginInfo, PluginSet},
    command::Elevation,
    measurement::{FieldValue, MeasurementBuffer, Timestamp},
    plugin::PluginMetadata,
    test::{FakeKstat, ScriptedRunner},
};
use plugin_smf::{Config, SmfPlugin};
use pretty_assertions::assert_eq;

const SVCS_ALL_ZONES: &str = "global           online         svc:/system/svc/restarter:default
global           online         svc:/network/physical:default
global           maintenance    svc:/network/ntp:default
serv-wf          online         svc:/network/physical:default
serv-wf          offline        svc:/site/wf:default
serv-wf          online         svc:/system/cron:default
";

fn config_to_toml_table(config: &Config) -> toml::Table {
    toml::Value::try_from(config).unwrap().as_table().unwrap().clone()
}

fn poll(config: Config, runner: ScriptedRunner) -> MeasurementBuffer {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init();

    let mut plugins = PluginSet::default();
    plugins.add_plugin(PluginInfo {
        metadata: PluginMetadata::from_static::<SmfPlugin>(),
        enabled: true,
        config: Some(config_to_toml_table(&config)),
    });
    let mut agent = agent::Builder::new(plugins)
        .with_command_runner(Arc::new(runner))
        .with_kstat_reader(Arc::new(FakeKstat::new()))
        .build_and_start()
        .expect("the smf plugin should start");
    let measurements = agent.poll_once(Timestamp::now());
    agent.stop();
    measurements
}

fn summary(measurements: &MeasurementBuffer) -> Vec<String> {
    measurements
        .iter()
        .map(|p| {
            let tags: Vec<String> = p.tags().map(|(k, v)| format!("{k}={v}")).collect();
            let fields: Vec<String> = p.fields().map(|(k, v)| format!("{k}={v}")).collect();
            format!("{} {}", tags.join(","), fields.join(","))
        })
        .collect()
}

#[test]
fn every_zone() {
    let runner = ScriptedRunner::new().with_output("/bin/pfexec /bin/svcs -aHZ -ozone,state,fmri", SVCS_ALL_ZONES);
    let measurements = poll(Config::default(), runner);
    assert_eq!(
        summary(&measurements),
        vec![
            "state=maintenance,zone=global states=1u",
            "state=online,zone=global states=2u",
            "state=offline,zone=serv-wf states=1u",
            "state=online,zone=serv-wf states=2u",
            "fmri=svc:/network/ntp:default,state=maintenance,zone=global errors=1u",
            "fmri=svc:/site/wf:default,state=offline,zone=serv-wf errors=1u",
        ]
    );
}

#[test]
fn filtered_without_details() {
    let runner = ScriptedRunner::new().with_output("/bin/pfexec /bin/svcs -aHZ -ozone,state,fmri", SVCS_ALL_ZONES);
    let config = Config {
        zones: vec![String::from("serv-wf")],
        svc_states: vec![String::from("online"), String::from("offline")],
        generate_details: false,
        ..Default::default()
    };
    let measurements = poll(config, runner);
    assert_eq!(measurements.len(), 2);
    for point in &measurements {
        assert_eq!(point.tag("zone"), Some("serv-wf"));
        assert_eq!(point.field("errors"), None);
    }
}

#[test]
fn current_zone_only() {
    let output = "global           online         svc:/system/svc/restarter:default
global           disabled       svc:/network/ntp:default
this line is malformed
";
    let runner = ScriptedRunner::new().with_output("/bin/svcs -aH -ozone,state,fmri", output);
    let config = Config {
        elevate_privs_with: Elevation::None,
        generate_details: false,
        ..Default::default()
    };
    let measurements = poll(config, runner);
    let counts: Vec<(Option<&str>, Option<&FieldValue>)> = measurements
        .iter()
        .map(|p| (p.tag("state"), p.field("states")))
        .collect();
    assert_eq!(
        counts,
        vec![
            (Some("disabled"), Some(&FieldValue::U64(1))),
            (Some("online"), Some(&FieldValue::U64(1))),
        ]
    );
}
