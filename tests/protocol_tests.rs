//! Wire format seen by producers and observers that are not this crate.

use std::path::Path;

use jobfleet::config::{ControllerConfig, Credentials, InstanceSpec};
use jobfleet::protocol::{decode_job, decode_status, Message, RunState};
use jobfleet::provision::{BootstrapParams, InstanceHandle, ScriptTemplate};
use jobfleet::queue::{InMemoryQueue, MessageQueue, SpoolQueue};
use jobfleet::store::BucketPath;
use serde_json::json;
use tempfile::TempDir;

const STATUS_BODY: &str = r#"{
    "type": "job_status",
    "job": {
        "type": "job",
        "id": "7f3c",
        "command": ["sh", "-c", "exit 2"],
        "num_cpus": 1,
        "expected_runtime": -1,
        "log_file_template": "run_%d.out",
        "batch_id": "QWERTYUIOP"
    },
    "instance": "i-0abc",
    "started_on": "2024-03-01T10:00:00Z",
    "last_update": "2024-03-01T10:05:00Z",
    "local_log_file": "/tmp/run_7f3c.out",
    "pid": 912,
    "status": "finished",
    "ret_code": 2
}"#;

#[test]
fn test_decodes_status_from_foreign_producer() {
    let status = decode_status(STATUS_BODY).unwrap();
    assert_eq!(status.job.id().as_str(), "7f3c");
    assert_eq!(status.job.log_file_name(), "run_7f3c.out");
    assert_eq!(status.job.expected_runtime(), None);
    assert_eq!(status.state, RunState::Finished { ret_code: 2 });
    assert_eq!(status.pid, Some(912));
    assert_eq!(status.local_log_file, Path::new("/tmp/run_7f3c.out"));
}

#[test]
fn test_status_reencodes_to_same_document() {
    let status = decode_status(STATUS_BODY).unwrap();
    let reencoded: serde_json::Value = serde_json::from_str(&status.encode().unwrap()).unwrap();
    let original: serde_json::Value = serde_json::from_str(STATUS_BODY).unwrap();
    assert_eq!(reencoded, original);
}

#[test]
fn test_running_status_without_ret_code() {
    let mut doc: serde_json::Value = serde_json::from_str(STATUS_BODY).unwrap();
    doc["status"] = json!("running");
    doc.as_object_mut().unwrap().remove("ret_code");
    doc["pid"] = json!(null);

    let status = decode_status(&doc.to_string()).unwrap();
    assert!(!status.is_finished());
    assert_eq!(status.pid, None);
}

#[test]
fn test_job_from_foreign_producer() {
    let body = json!({
        "type": "job",
        "id": "42",
        "command": ["make", "-j4"],
        "num_cpus": 4,
        "expected_runtime": 3600,
        "log_file_template": "job_%d.log",
        "batch_id": "NIGHTLY"
    });
    let job = decode_job(&body.to_string()).unwrap();
    assert_eq!(job.num_cpus(), 4);
    assert_eq!(
        job.expected_runtime(),
        Some(std::time::Duration::from_secs(3600))
    );
    assert_eq!(
        Message::decode(&body.to_string()).unwrap().type_name(),
        "job"
    );
}

#[test]
fn test_job_with_integer_id() {
    let body = json!({
        "type": "job",
        "id": 7,
        "command": ["true"],
        "num_cpus": 1,
        "expected_runtime": -1,
        "log_file_template": "job_%d.log",
        "batch_id": "B"
    });
    let job = decode_job(&body.to_string()).unwrap();
    assert_eq!(job.id().as_str(), "7");
    assert_eq!(job.log_file_name(), "job_7.log");
}

#[test]
fn test_rejects_job_with_path_in_log_template() {
    let body = json!({
        "type": "job",
        "id": "42",
        "command": ["true"],
        "num_cpus": 1,
        "expected_runtime": -1,
        "log_file_template": "../../etc/%d",
        "batch_id": "B"
    });
    assert!(decode_job(&body.to_string()).is_err());
}

#[tokio::test]
async fn test_spool_and_memory_queues_agree_on_update() {
    let dir = TempDir::new().unwrap();
    let spool = SpoolQueue::open(dir.path().join("status")).await.unwrap();
    let memory = InMemoryQueue::new("status");
    let queues: [&dyn MessageQueue; 2] = [&spool, &memory];

    for queue in queues {
        let handle = queue.post("running".into()).await.unwrap();
        queue.update(&handle, "finished".into()).await.unwrap();

        let got = queue
            .receive(std::time::Duration::ZERO)
            .await
            .unwrap()
            .expect("one message");
        assert_eq!(got.handle, handle);
        assert_eq!(got.body, "finished");
        assert!(queue
            .receive(std::time::Duration::ZERO)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_bundled_templates_fill_completely() {
    let mut config = ControllerConfig::new(
        InstanceSpec::new("ami-1", "key"),
        BucketPath::parse("results/run1").unwrap(),
    )
    .with_jobs_per_instance(4);
    config.region_endpoint = "ec2.example.internal".into();
    config.credentials = Credentials {
        access_key: "AK".into(),
        secret_key: "SK".into(),
    };
    let instance = InstanceHandle::new("i-7").with_public_dns_name("host-7");
    let params = BootstrapParams::for_instance(&config, &instance);

    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("sh");

    let s3cfg = ScriptTemplate::from_file(&root.join("s3cfg"))
        .await
        .unwrap()
        .fill(&params.credential_vars());
    assert!(s3cfg.contains("access_key = AK"));
    assert!(s3cfg.contains("secret_key = SK"));
    assert!(!s3cfg.contains('#'));

    let startup = ScriptTemplate::from_file(&root.join("start-worker.sh"))
        .await
        .unwrap()
        .fill(&params.template_vars());
    assert!(startup.contains(r#"EC2_INSTANCE_ID="i-7""#));
    assert!(startup.contains(r#"EC2_DNS_NAME="host-7""#));
    assert!(startup.contains(r#"NUM_JOBS_PER_INSTANCE="4""#));
    assert!(startup.contains(r#"JOBFLEET_BUCKET="results/run1""#));
    assert!(startup.contains(r#"if [ "True" = "True" ]"#));
    assert!(startup.contains(r#"AWS_ACCESS_KEY_ID="AK""#));
    assert!(startup.contains(r#"AWS_SECRET_ACCESS_KEY="SK""#));
    assert!(startup.contains(r#"JOBFLEET_REGION_URL="http://ec2.example.internal""#));
    assert!(!startup.contains("#ACCESS_KEY#"));
    for name in ["#INSTANCE_ID#", "#DNS_NAME#", "#BUCKET#", "#QUIT_WHEN_EMPTY#"] {
        assert!(!startup.contains(name));
    }
}
