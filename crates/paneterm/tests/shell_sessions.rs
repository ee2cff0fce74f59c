//! Shell sessions against real processes.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use paneterm::pty::{platform_backend, Platform, PtyTiming};
use paneterm::{
    AnyPseudoterminal, ExitStatus, Pseudoterminal, PseudoterminalError, RefPseudoterminal,
    ShellPseudoterminalArguments, TokioSpawner, VirtualDisplay,
};

fn open(executable: &str, args: &[&str]) -> AnyPseudoterminal {
    let mut arguments = ShellPseudoterminalArguments::new(executable);
    arguments.args = args.iter().map(|a| a.to_string()).collect();
    open_with(arguments)
}

fn open_with(arguments: ShellPseudoterminalArguments) -> AnyPseudoterminal {
    let backend = platform_backend(Platform::current()).unwrap();
    backend.open(arguments, Arc::new(TokioSpawner), PtyTiming::default())
}

async fn exit_of(pty: &impl Pseudoterminal) -> ExitStatus {
    tokio::time::timeout(Duration::from_secs(10), pty.on_exit())
        .await
        .expect("session did not exit")
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_output_reaches_display() {
    let pty = open("/bin/sh", &["-c", "sleep 0.3; echo hi"]);
    let display = Arc::new(VirtualDisplay::new(40, 5));
    pty.pipe(display.clone()).await.unwrap();

    assert_eq!(exit_of(&pty).await, ExitStatus::Code(0));
    eventually(|| display.contents().contains("hi")).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_output_reaches_late_display() {
    for _ in 0..50 {
        let pty = open("/bin/echo", &["hi"]);
        pty.shell().unwrap().await.unwrap();
        let display = Arc::new(VirtualDisplay::new(40, 5));
        pty.pipe(display.clone()).await.unwrap();

        assert_eq!(exit_of(&pty).await, ExitStatus::Code(0));
        eventually(|| display.contents().contains("hi")).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_display_attached_after_exit_sees_output() {
    let pty = open("/bin/echo", &["hi"]);
    assert_eq!(exit_of(&pty).await, ExitStatus::Code(0));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let display = Arc::new(VirtualDisplay::new(40, 5));
    pty.pipe(display.clone()).await.unwrap();
    eventually(|| display.contents().contains("hi")).await;
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let pty = open("/bin/sh", &["-c", "exit 3"]);
    assert_eq!(exit_of(&pty).await, ExitStatus::Code(3));

    // The first display takes whatever was printed; later ones are refused.
    let display = Arc::new(VirtualDisplay::new(40, 5));
    pty.pipe(display).await.unwrap();
    assert_eq!(
        pty.pipe(Arc::new(VirtualDisplay::new(40, 5))).await,
        Err(PseudoterminalError::Exited)
    );
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let pty = open("/nonexistent/paneterm-shell", &[]);
    let err = tokio::time::timeout(Duration::from_secs(5), pty.on_exit())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PseudoterminalError::SpawnFailed(_)));
}

#[tokio::test]
async fn test_display_input_reaches_process() {
    let pty = open("/bin/cat", &[]);
    let display = Arc::new(VirtualDisplay::new(40, 5));
    pty.pipe(display.clone()).await.unwrap();

    display.input("hello\n");
    eventually(|| display.contents().contains("hello")).await;

    pty.kill().await.unwrap();
    assert!(matches!(exit_of(&pty).await, ExitStatus::Signal(_)));
}

#[tokio::test]
async fn test_kill_ends_long_running_process() {
    let pty = open("/bin/sleep", &["30"]);
    pty.shell().unwrap().await.unwrap();
    pty.kill().await.unwrap();

    match exit_of(&pty).await {
        ExitStatus::Signal(name) => assert!(name.starts_with("SIG")),
        other => panic!("expected a signal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resize_without_interpreter_is_disabled() {
    let pty = open("/bin/sleep", &["30"]);
    assert_eq!(
        pty.resize(100, 30).await,
        Err(PseudoterminalError::ResizerDisabled)
    );
    pty.kill().await.unwrap();
}

#[tokio::test]
async fn test_shared_session_outlives_first_view() {
    let first = RefPseudoterminal::new(open("/bin/sleep", &["30"]));
    let second = first.dup();
    first.delegate().shell().unwrap().await.unwrap();

    first.kill().await.unwrap();
    assert_eq!(exit_of(&first).await, ExitStatus::Code(0));
    assert!(!second.on_exit().is_settled());
    assert_eq!(second.ref_count(), 1);

    second.kill().await.unwrap();
    assert!(matches!(exit_of(&second).await, ExitStatus::Signal(_)));
}

#[tokio::test]
async fn test_resize_through_helper() {
    let Ok(python) = which::which("python3") else {
        return;
    };
    let mut arguments = ShellPseudoterminalArguments::new("/bin/sh");
    arguments.args = vec!["-c".to_string(), "sleep 1; stty size".to_string()];
    arguments.python_executable = Some(python.to_string_lossy().into_owned());
    arguments.terminal = Some("xterm-256color".to_string());

    let pty = open_with(arguments);
    let display = Arc::new(VirtualDisplay::new(100, 30));
    pty.pipe(display.clone()).await.unwrap();
    pty.resize(100, 30).await.unwrap();

    assert_eq!(exit_of(&pty).await, ExitStatus::Code(0));
    eventually(|| display.contents().contains("30 100")).await;
}
