//! Newline-delimited JSON test report.

mod messages;

use std::{
    io,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use time::OffsetDateTime;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub use messages::{
    BeginSuite, BeginTest, FinishSuite, FinishTest, Message, RelayerExecMessage, TestNote,
    TestTimestamp,
};

use crate::relayer::{RelayerExec, RelayerExecReporter};

const QUEUE_CAPACITY: usize = 256;

type Sink = Box<dyn AsyncWrite + Unpin + Send>;

/// Queues a message for the writer task. A full queue hands the message to a
/// task that waits for room.
fn post(tx: &mpsc::Sender<Message>, message: Message) {
    match tx.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(message).await.is_err() {
                    debug!("report message dropped after close");
                }
            });
        }
        Err(TrySendError::Closed(_)) => debug!("report message dropped after close"),
    }
}

/// Serializes report messages from any task onto one sink. Must be created
/// inside a tokio runtime.
pub struct Reporter {
    tx: mpsc::Sender<Message>,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl Reporter {
    /// Spawns the writer and emits `BeginSuite`.
    pub fn new(sink: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = tokio::spawn(write_messages(Box::new(sink), rx));
        post(
            &tx,
            Message::BeginSuite(BeginSuite {
                started_at: OffsetDateTime::now_utc(),
            }),
        );
        Self {
            tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Emits `BeginTest` and returns a handle that reports on that test.
    #[must_use]
    pub fn track_test(&self, name: impl Into<String>) -> TestReporter {
        let name = name.into();
        post(
            &self.tx,
            Message::BeginTest(BeginTest {
                name: name.clone(),
                started_at: OffsetDateTime::now_utc(),
            }),
        );
        TestReporter {
            name,
            tx: self.tx.clone(),
            failed: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn relayer_exec_reporter(&self, test_name: impl Into<String>) -> TestRelayerExecReporter {
        TestRelayerExecReporter {
            test_name: test_name.into(),
            tx: self.tx.clone(),
        }
    }

    /// Emits `FinishSuite`, drains the queue and closes the sink. Later calls
    /// do nothing.
    pub async fn close(&self) -> io::Result<()> {
        let writer = self.writer.lock().ok().and_then(|mut writer| writer.take());
        let Some(writer) = writer else {
            return Ok(());
        };

        let finish = Message::FinishSuite(FinishSuite {
            finished_at: OffsetDateTime::now_utc(),
        });
        if self.tx.send(finish).await.is_err() {
            warn!("report writer stopped before the suite finished");
        }
        writer.await.map_err(io::Error::other)?
    }
}

/// Writes every message until `FinishSuite`, then flushes and shuts the sink.
async fn write_messages(sink: Sink, mut rx: mpsc::Receiver<Message>) -> io::Result<()> {
    let mut out = BufWriter::new(sink);
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        if matches!(message, Message::FinishSuite(_)) {
            break;
        }
    }
    rx.close();
    out.flush().await?;
    out.shutdown().await
}

/// Report writing into a file, truncating it.
pub async fn new_file_reporter(path: impl AsRef<Path>) -> io::Result<Reporter> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    Ok(Reporter::new(file))
}

/// Reports on one test. Dropping it without [`TestReporter::finish`] still
/// emits `FinishTest`, failed if the thread is panicking.
pub struct TestReporter {
    name: String,
    tx: mpsc::Sender<Message>,
    failed: AtomicBool,
    skipped: AtomicBool,
    finished: AtomicBool,
}

impl TestReporter {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        post(
            &self.tx,
            Message::PauseTest(TestTimestamp {
                name: self.name.clone(),
                when: OffsetDateTime::now_utc(),
            }),
        );
    }

    pub fn resume(&self) {
        post(
            &self.tx,
            Message::ContinueTest(TestTimestamp {
                name: self.name.clone(),
                when: OffsetDateTime::now_utc(),
            }),
        );
    }

    /// Records an error and marks the test failed.
    pub fn error(&self, message: impl Into<String>) {
        self.failed.store(true, Ordering::SeqCst);
        post(&self.tx, Message::TestError(self.note(message.into())));
    }

    pub fn skip(&self, message: impl Into<String>) {
        self.skipped.store(true, Ordering::SeqCst);
        post(&self.tx, Message::TestSkip(self.note(message.into())));
    }

    #[must_use]
    pub fn relayer_exec_reporter(&self) -> TestRelayerExecReporter {
        TestRelayerExecReporter {
            test_name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn finish(self) {
        self.emit_finish(false);
    }

    fn note(&self, message: String) -> TestNote {
        TestNote {
            name: self.name.clone(),
            when: OffsetDateTime::now_utc(),
            message,
        }
    }

    fn emit_finish(&self, panicking: bool) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        post(
            &self.tx,
            Message::FinishTest(FinishTest {
                name: self.name.clone(),
                finished_at: OffsetDateTime::now_utc(),
                failed: self.failed() || panicking,
                skipped: self.skipped.load(Ordering::SeqCst),
            }),
        );
    }
}

impl Drop for TestReporter {
    fn drop(&mut self) {
        self.emit_finish(std::thread::panicking());
    }
}

/// Forwards relayer command records into the report under a test name.
#[derive(Clone)]
pub struct TestRelayerExecReporter {
    test_name: String,
    tx: mpsc::Sender<Message>,
}

impl RelayerExecReporter for TestRelayerExecReporter {
    fn track_relayer_exec(&self, exec: RelayerExec) {
        post(
            &self.tx,
            Message::RelayerExec(RelayerExecMessage {
                name: self.test_name.clone(),
                started_at: exec.started_at,
                finished_at: exec.finished_at,
                container_name: exec.container_name,
                command: exec.command,
                stdout: exec.stdout,
                stderr: exec.stderr,
                exit_code: exec.exit_code,
                error: exec.error,
            }),
        );
    }
}

/// Discards relayer command records.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopRelayerExecReporter;

impl RelayerExecReporter for NopRelayerExecReporter {
    fn track_relayer_exec(&self, _exec: RelayerExec) {}
}
