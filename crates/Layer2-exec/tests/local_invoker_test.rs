//! LocalInvoker tests using `sh -c` scripts as the tool

#![cfg(unix)]

use conduit_exec::{
    ExecuteOptions, ExecutionOrchestrator, InvokeOptions, Invoker, LocalInvoker,
};
use conduit_foundation::event::PROGRESS;
use conduit_foundation::{
    CancellationToken, ConduitConfig, Error, EventBus, EventFilter, ParserConfig, ToolConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `sh -c <script> conduit-tool <command> <args...>`: the command is `$1`
fn script_tool(script: &str) -> ToolConfig {
    ToolConfig {
        program: "sh".into(),
        base_args: vec!["-c".into(), script.into(), "conduit-tool".into()],
        ..Default::default()
    }
}

fn invoker(script: &str) -> LocalInvoker {
    LocalInvoker::new(script_tool(script), ParserConfig::default())
        .with_kill_grace(Duration::from_millis(100))
}

#[tokio::test]
async fn test_stdout_frames_become_messages() {
    let invoker = invoker(
        r#"printf '{"type":"progress","percentage":50}\n{"command":"%s",' "$1"; printf '"args":%s}\n' "$#""#,
    );

    let result = invoker
        .invoke(
            "status",
            &["--verbose".to_string()],
            InvokeOptions::new(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.messages, vec![json!({"command": "status", "args": 2})]);
}

#[tokio::test]
async fn test_non_zero_exit_reports_stderr() {
    let invoker = invoker("echo 'warming up' >&2; echo 'fatal: index corrupt' >&2; exit 3");

    let result = invoker
        .invoke("status", &[], InvokeOptions::new(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.error.as_deref(), Some("fatal: index corrupt"));
    assert!(result.stderr.contains("warming up"));
}

#[tokio::test]
async fn test_cancellation_kills_process() {
    let invoker = invoker("sleep 30");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = invoker
        .invoke(
            "analyze",
            &[],
            InvokeOptions::new(Duration::from_secs(60)).with_cancel(cancel),
        )
        .await
        .unwrap_err();

    assert!(err.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let invoker = invoker("sleep 30");

    let started = Instant::now();
    let err = invoker
        .invoke("analyze", &[], InvokeOptions::new(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_working_dir_and_env_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

    let mut tool = script_tool(
        r#"test -f marker.txt && printf '{"found":true,"value":"%s"}\n' "$CONDUIT_TEST_VALUE""#,
    );
    tool.working_dir = Some(dir.path().to_string_lossy().into_owned());
    tool.env.insert("CONDUIT_TEST_VALUE".into(), "42".into());
    let invoker = LocalInvoker::new(tool, ParserConfig::default());

    let result = invoker
        .invoke("info", &[], InvokeOptions::new(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output(), Some(&json!({"found": true, "value": "42"})));
}

#[tokio::test]
async fn test_orchestrated_process_is_cached_and_tracked() {
    let mut config = ConduitConfig::default();
    config.tool = script_tool(
        r#"printf '{"type":"progress","percentage":40}\n'; printf '{"ran":"%s"}\n' "$1""#,
    );
    let invoker = Arc::new(LocalInvoker::new(config.tool.clone(), config.parser.clone()));
    let bus = Arc::new(EventBus::new());
    let orchestrator = ExecutionOrchestrator::new(invoker, &config, bus.clone());

    let first = orchestrator
        .execute("analyze", &json!({"path": "src"}), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.output(), Some(&json!({"ran": "analyze"})));

    let filter = EventFilter::new().with_event_types(vec![PROGRESS.to_string()]);
    let reported = bus
        .search_history(&filter)
        .iter()
        .any(|e| e.data["progress"].as_f64() == Some(40.0));
    assert!(reported);

    let second = orchestrator
        .execute("analyze", &json!({"path": "src"}), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(orchestrator.statistics().total, 1);
}
