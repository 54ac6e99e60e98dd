//! End-to-end runs against a real Docker daemon. They need the builtin images
//! to be present, so they are ignored by default:
//!
//! ```sh
//! cargo test -- --ignored docker
//! ```

use std::{sync::Arc, time::Duration};

use test_log::test;

use crate::{
    config::ExecutorConfig,
    model::{ErrorKind, SubmissionRequest},
    orchestrator::Executor,
    runner::{ContainerEngine, DockerEngine},
};

use super::util::workspace_count;

fn executor(root: &std::path::Path) -> (Arc<dyn ContainerEngine>, Executor) {
    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect_with_local_defaults().unwrap());
    let cfg = ExecutorConfig {
        scratch_root: root.to_owned(),
        ..Default::default()
    };
    let executor = cfg.build_executor(engine.clone()).unwrap();
    (engine, executor)
}

async fn managed_count(engine: &Arc<dyn ContainerEngine>) -> usize {
    engine.list_managed().await.unwrap().len()
}

#[test(tokio::test)]
#[ignore]
async fn test_docker_hello_world() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, executor) = executor(tmp.path());
    let before = managed_count(&engine).await;

    let cases = [
        ("python", "main.py", "print('Hello, world!')"),
        (
            "javascript",
            "main.js",
            "console.log('Hello, world!')",
        ),
        (
            "cpp",
            "main.cpp",
            "#include <cstdio>\nint main() { puts(\"Hello, world!\"); }",
        ),
        (
            "java",
            "Main.java",
            "public class Main { public static void main(String[] a) { System.out.println(\"Hello, world!\"); } }",
        ),
    ];
    for (language, filename, source) in cases {
        let req = SubmissionRequest::new(language, filename, source, 512, 20);
        let res = executor.execute(req).await.unwrap();
        assert!(res.is_success(), "{}: {:?}", language, res);
        assert_eq!(res.output_lossy().trim(), "Hello, world!");
    }

    assert_eq!(managed_count(&engine).await, before);
    assert_eq!(workspace_count(tmp.path()), 0);
}

#[test(tokio::test)]
#[ignore]
async fn test_docker_sleep_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let (_engine, executor) = executor(tmp.path());

    let req = SubmissionRequest::new("python", "main.py", "import time\ntime.sleep(30)", 128, 2);
    let start = std::time::Instant::now();
    let res = executor.execute(req).await.unwrap();
    assert_eq!(res.error_kind, ErrorKind::TimedOut);
    // time limit + default grace, plus container setup
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test(tokio::test)]
#[ignore]
async fn test_docker_fork_bomb_is_contained() {
    let tmp = tempfile::tempdir().unwrap();
    let (_engine, executor) = executor(tmp.path());

    let source = "import os\nwhile True:\n    try:\n        os.fork()\n    except OSError:\n        pass\n";
    let req = SubmissionRequest::new("python", "main.py", source, 128, 3);
    let res = executor.execute(req).await.unwrap();
    assert_eq!(res.error_kind, ErrorKind::TimedOut);
    assert_eq!(workspace_count(tmp.path()), 0);
}

#[test(tokio::test)]
#[ignore]
async fn test_docker_sandbox_is_read_only() {
    let tmp = tempfile::tempdir().unwrap();
    let (_engine, executor) = executor(tmp.path());

    let source = r#"
import os, socket
for path in ["/app/code/x", "/etc/x"]:
    try:
        open(path, "w")
        print("wrote", path)
    except OSError:
        print("denied", path)
open("/scratch/x", "w").write("ok")
try:
    socket.create_connection(("1.1.1.1", 53), timeout=1)
    print("network")
except OSError:
    print("offline")
"#;
    let req = SubmissionRequest::new("python", "main.py", source, 128, 5);
    let res = executor.execute(req).await.unwrap();
    assert!(res.is_success(), "{:?}", res);
    assert_eq!(
        res.output_lossy(),
        "denied /app/code/x\ndenied /etc/x\noffline\n"
    );
}

#[test(tokio::test)]
#[ignore]
async fn test_docker_flood_is_capped() {
    let tmp = tempfile::tempdir().unwrap();
    let (_engine, executor) = executor(tmp.path());

    let source = "import sys\nwhile True:\n    sys.stdout.write('x' * 4096)\n";
    let req = SubmissionRequest::new("python", "main.py", source, 128, 2);
    let res = executor.execute(req).await.unwrap();
    assert_eq!(res.error_kind, ErrorKind::TimedOut);
    assert!(res.truncated);
    assert_eq!(res.output.len(), 1024 * 1024);
    assert!(res.output.iter().all(|&b| b == b'x'));
}
