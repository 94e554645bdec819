use std::sync::Arc;

use illumos_metrics::{
    agent::{self, PluginInfo, PluginSet},
    measurement::{FieldValue, MeasurementBuffer, Timestamp},
    plugin::PluginMetadata,
    test::{FakeKstat, ScriptedRunner},
};
use plugin_network::{Config, NetworkPlugin};
use pretty_assertions::assert_eq;

const DLADM: &str = "dns_net0:dns:rge0:1000
www_net0:www:rge0:1000
media_net0:cube-media:e1000g0:100";

const LINK_KSTATS: &str = "link:0:dns_net0:obytes64\t1000
link:0:dns_net0:rbytes64\t2000
link:0:dns_net0:ierrors\t1
link:0:dns_net0:snaptime\t55.5
link:0:rge0:obytes64\t300000
link:0:rge0:rbytes64\t400000
link:0:rge0:link_duplex\tfull
link:0:www_net0:obytes64\t10
link:0:www_net0:rbytes64\t20";

fn config_to_toml_table(config: &Config) -> toml::Table {
    toml::Value::try_from(config).unwrap().as_table().unwrap().clone()
}

fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .with_output("/bin/zonename", "global\n")
        .with_output("/usr/sbin/dladm show-vnic -po link,zone,over,speed", DLADM)
}

fn poll(config: Config, runner: ScriptedRunner) -> MeasurementBuffer {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init();

    let mut plugins = PluginSet::default();
    plugins.add_plugin(PluginInfo {
        metadata: PluginMetadata::from_static::<NetworkPlugin>(),
        enabled: true,
        config: Some(config_to_toml_table(&config)),
    });
    let mut agent = agent::Builder::new(plugins)
        .with_command_runner(Arc::new(runner))
        .with_kstat_reader(Arc::new(FakeKstat::new().with_kstat_p(LINK_KSTATS)))
        .build_and_start()
        .expect("the network plugin should start");
    let measurements = agent.poll_once(Timestamp::now());
    agent.stop();
    measurements
}

#[test]
fn every_link() {
    let measurements = poll(Config::default(), runner());
    assert_eq!(measurements.len(), 3);

    let dns = measurements.iter().next().unwrap();
    assert_eq!(dns.name, "net");
    let tags: Vec<(&str, &str)> = dns.tags().collect();
    assert_eq!(
        tags,
        vec![
            ("link", "rge0"),
            ("name", "dns_net0"),
            ("speed", "1000mbit"),
            ("zone", "dns"),
        ]
    );
    let fields: Vec<(&str, &FieldValue)> = dns.fields().collect();
    assert_eq!(
        fields,
        vec![
            ("obytes64", &FieldValue::F64(1000.0)),
            ("rbytes64", &FieldValue::F64(2000.0)),
            ("snaptime", &FieldValue::F64(55.5)),
        ]
    );

    let rge = measurements.iter().nth(1).unwrap();
    let tags: Vec<(&str, &str)> = rge.tags().collect();
    assert_eq!(
        tags,
        vec![
            ("link", "none"),
            ("name", "rge0"),
            ("speed", "unknown"),
            ("zone", "global"),
        ]
    );
    assert_eq!(rge.field("rbytes64"), Some(&FieldValue::F64(400_000.0)));
}

#[test]
fn selected_zones_and_vnics() {
    let config = Config {
        zones: vec![String::from("dns"), String::from("www")],
        vnics: vec![String::from("www_net0"), String::from("rge0")],
        fields: vec![String::from("obytes64")],
    };
    let measurements = poll(config, runner());
    assert_eq!(measurements.len(), 1);

    let www = measurements.iter().next().unwrap();
    assert_eq!(www.tag("zone"), Some("www"));
    assert_eq!(www.fields_len(), 1);
    assert_eq!(www.field("obytes64"), Some(&FieldValue::F64(10.0)));
}

#[test]
fn inside_a_non_global_zone() {
    // dladm only shows the vnics of the zone, which are local links
    let runner = ScriptedRunner::new()
        .with_output("/bin/zonename", "dns\n")
        .with_output("/usr/sbin/dladm show-vnic -po link,zone,over,speed", "dns_net0:dns:rge0:1000");
    let config = Config {
        vnics: vec![String::from("dns_net0")],
        ..Default::default()
    };
    let measurements = poll(config, runner);
    let dns = measurements.iter().next().unwrap();
    assert_eq!(dns.tag("zone"), Some("dns"));
    assert_eq!(dns.tag("link"), Some("none"));
    assert_eq!(dns.tag("name"), Some("dns_net0"));
}

#[test]
fn unknown_zone_name() {
    let mut plugins = PluginSet::default();
    plugins.add_plugin(PluginInfo {
        metadata: PluginMetadata::from_static::<NetworkPlugin>(),
        enabled: true,
        config: None,
    });
    let res = agent::Builder::new(plugins)
        .with_command_runner(Arc::new(ScriptedRunner::new()))
        .with_kstat_reader(Arc::new(FakeKstat::new()))
        .build_and_start();
    assert!(res.is_err(), "the plugin should not start without the name of the zone");
}
