use std::sync::Arc;

use illumos_metrics::{
    agent::{self, PluginInfo, PluginSet},
    measurement::{FieldValue, MeasurementBuffer, Timestamp},
    plugin::PluginMetadata,
    test::{FakeKstat, ScriptedRunner},
};
use plugin_disk_health::{Config, DiskHealthPlugin};
use pretty_assertions::assert_eq;

const KSTATS: &str = "sderr:6:sd6,err:class\tdevice_error
sderr:6:sd6,err:Device Not Ready\t0
sderr:6:sd6,err:Hard Errors\t0
sderr:6:sd6,err:Illegal Request\t1148
sderr:6:sd6,err:Media Error\t0
sderr:6:sd6,err:No Device\t0
sderr:6:sd6,err:Predictive Failure Analysis\t0
sderr:6:sd6,err:Product\tMy Passport 2627
sderr:6:sd6,err:Recoverable\t0
sderr:6:sd6,err:Revision\t4008
sderr:6:sd6,err:Serial No\tWXP1E7916Z6K
sderr:6:sd6,err:Size\t2000398934016
sderr:6:sd6,err:Soft Errors\t0
sderr:6:sd6,err:Transport Errors\t0
sderr:6:sd6,err:Vendor\tWD
sderr:6:sd6,err:crtime\t44.03
sderr:6:sd6,err:snaptime\t866016.70
blkdeverr:0:blkdev0,err:class\tdevice_error
blkdeverr:0:blkdev0,err:Hard Errors\t0
blkdeverr:0:blkdev0,err:Illegal Request\t0
blkdeverr:0:blkdev0,err:Revision\tP9CR30A
blkdeverr:0:blkdev0,err:Serial No\t2301E699B2E7
blkdeverr:0:blkdev0,err:Soft Errors\t0
blkdeverr:0:blkdev0,err:Transport Errors\t0
sd:6:sd6:class\tdisk
sd:6:sd6:reads\t12";

fn config_to_toml_table(config: &Config) -> toml::Table {
    toml::Value::try_from(config).unwrap().as_table().unwrap().clone()
}

fn poll(config: Config, kstat: FakeKstat) -> MeasurementBuffer {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init();

    let mut plugins = PluginSet::default();
    plugins.add_plugin(PluginInfo {
        metadata: PluginMetadata::from_static::<DiskHealthPlugin>(),
        enabled: true,
        config: Some(config_to_toml_table(&config)),
    });
    let mut agent = agent::Builder::new(plugins)
        .with_command_runner(Arc::new(ScriptedRunner::new()))
        .with_kstat_reader(Arc::new(kstat))
        .build_and_start()
        .expect("the disk-health plugin should start");
    let measurements = agent.poll_once(Timestamp::now());
    agent.stop();
    measurements
}

#[test]
fn errors_of_a_disk() {
    let config = Config {
        devices: vec![String::from("sd6")],
        ..Config::default()
    };
    let measurements = poll(config, FakeKstat::new().with_kstat_p(KSTATS));
    assert_eq!(measurements.len(), 1);

    let point = measurements.iter().next().unwrap();
    assert_eq!(point.name, "diskHealth");
    let fields: Vec<(&str, &FieldValue)> = point.fields().collect();
    assert_eq!(
        fields,
        vec![
            ("hardErrors", &FieldValue::F64(0.0)),
            ("illegalRequest", &FieldValue::F64(1148.0)),
            ("softErrors", &FieldValue::F64(0.0)),
            ("transportErrors", &FieldValue::F64(0.0)),
        ]
    );
    let tags: Vec<(&str, &str)> = point.tags().collect();
    assert_eq!(
        tags,
        vec![
            ("device", "sd6"),
            ("product", "My Passport 2627"),
            ("revision", "4008"),
            ("serialNo", "WXP1E7916Z6K"),
            ("vendor", "WD"),
        ]
    );
}

#[test]
fn missing_tags() {
    let config = Config {
        devices: vec![String::from("blkdev0")],
        ..Config::default()
    };
    let measurements = poll(config, FakeKstat::new().with_kstat_p(KSTATS));
    let point = measurements.iter().next().unwrap();
    let tags: Vec<(&str, &str)> = point.tags().collect();
    assert_eq!(
        tags,
        vec![("device", "blkdev0"), ("revision", "P9CR30A"), ("serialNo", "2301E699B2E7")]
    );
    assert_eq!(point.fields_len(), 4);
}

#[test]
fn size_as_a_tag() {
    let config = Config {
        devices: vec![String::from("sd6")],
        fields: vec![String::from("Media Error")],
        tags: vec![String::from("Size")],
    };
    let measurements = poll(config, FakeKstat::new().with_kstat_p(KSTATS));
    let point = measurements.iter().next().unwrap();
    assert_eq!(point.tag("size"), Some("1.8Tb"));
    assert_eq!(point.field("mediaError"), Some(&FieldValue::F64(0.0)));
    assert_eq!(point.fields_len(), 1);
}

#[test]
fn every_device() {
    let measurements = poll(Config::default(), FakeKstat::new().with_kstat_p(KSTATS));
    let devices: Vec<&str> = measurements.iter().map(|p| p.tag("device").unwrap()).collect();
    assert_eq!(devices, vec!["blkdev0", "sd6"]);
}

#[test]
fn kstat_unavailable() {
    assert!(poll(Config::default(), FakeKstat::failing()).is_empty());
}
