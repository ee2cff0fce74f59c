//! Developer console sessions driven through displays.

use std::sync::Arc;
use std::time::Duration;

use paneterm::logging::ConsoleLayer;
use paneterm::{
    DeveloperConsolePseudoterminal, Key, KeyEvent, LogStream, Pseudoterminal,
    PseudoterminalError, RefPseudoterminal, TerminalDisplay, VirtualDisplay, EXIT_SUCCESS,
};
use protocol::LogRecord;
use tracing_subscriber::layer::SubscriberExt;

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn submit(display: &VirtualDisplay, code: &str) {
    display.input(code);
    display.press(KeyEvent::plain(Key::Enter), "\r");
}

#[tokio::test]
async fn test_tracing_events_appear_in_console() {
    let log = LogStream::new(100);
    let subscriber = tracing_subscriber::registry().with(ConsoleLayer::new(log.clone()));
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(target: "app", user = 7, "signed in");
        tracing::warn!(target: "paneterm::console", "not republished");
    });

    let console = DeveloperConsolePseudoterminal::new(log.clone());
    let display = Arc::new(VirtualDisplay::new(60, 10));
    console.pipe(display.clone()).await.unwrap();

    assert_eq!(display.row(0), "[app] signed in user=7");
    assert_eq!(display.row(1), "");
    assert_eq!(log.history().len(), 1);
}

#[tokio::test]
async fn test_scripts_log_through_the_stream() {
    let log = LogStream::new(100);
    let console = DeveloperConsolePseudoterminal::new(log.clone());
    let display = Arc::new(VirtualDisplay::new(60, 10));
    console.pipe(display.clone()).await.unwrap();

    submit(&display, "console.log('hello', { n: 1 }); 'done'");

    eventually(|| display.row(1) == "hello { n: 1 }" && display.row(2) == "done").await;
    assert!(log
        .history()
        .iter()
        .any(|entry| matches!(entry.record, LogRecord::Info(_))));
}

#[tokio::test]
async fn test_evaluate_without_display() {
    let log = LogStream::new(100);
    let console = DeveloperConsolePseudoterminal::new(log.clone());
    console.evaluate("[1, 2, 3].map(x => x * 2)").await;

    let display = Arc::new(VirtualDisplay::new(60, 10));
    console.pipe(display.clone()).await.unwrap();
    assert_eq!(display.row(0), "[1, 2, 3].map(x => x * 2)");
    assert_eq!(display.row(1), "[ 2, 4, 6 ]");
}

#[tokio::test]
async fn test_shared_console_closes_with_last_view() {
    let log = LogStream::new(100);
    let first = RefPseudoterminal::new(DeveloperConsolePseudoterminal::new(log.clone()));
    let second = first.dup();

    let display = Arc::new(VirtualDisplay::new(40, 5));
    second.pipe(display.clone()).await.unwrap();

    first.kill().await.unwrap();
    assert_eq!(first.on_exit().await, Ok(EXIT_SUCCESS));
    log.publish(LogRecord::info("still here"));
    eventually(|| display.row(0) == "still here").await;

    second.kill().await.unwrap();
    assert_eq!(second.on_exit().await, Ok(EXIT_SUCCESS));
    assert_eq!(
        second.pipe(Arc::new(VirtualDisplay::new(40, 5))).await,
        Err(PseudoterminalError::Exited)
    );
    assert!(second.delegate().display_ids().is_empty());
}

#[tokio::test]
async fn test_late_display_sees_whole_session() {
    let log = LogStream::new(100);
    let console = DeveloperConsolePseudoterminal::new(log.clone());
    let early = Arc::new(VirtualDisplay::new(40, 8));
    console.pipe(early.clone()).await.unwrap();

    log.publish(LogRecord::warn("careful"));
    submit(&early, "6 * 7");
    eventually(|| early.contents().contains("42")).await;

    let late = Arc::new(VirtualDisplay::new(40, 8));
    console.pipe(late.clone()).await.unwrap();
    assert_eq!(late.row(0), "careful");
    assert_eq!(late.row(1), "6 * 7");
    assert_eq!(late.row(2), "42");
    assert_eq!(late.cursor().1, 3);
    assert_eq!(console.display_ids().len(), 2);
    assert!(console.display_ids().contains(&late.id()));
}
