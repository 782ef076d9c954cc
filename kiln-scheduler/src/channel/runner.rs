use super::{ChannelStats, WorkerChannel};
use crate::{ChannelKind, SchedulerError, SchedulerResult};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

// How long a channel thread waits before looping again
const IDLE_WAIT: Duration = Duration::from_millis(10);
const BUSY_WAIT: Duration = Duration::from_millis(1);

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Set once a channel stops for good. The manager checks it while polling and turns it into a
/// `ChannelTerminated` error.
pub(crate) struct ChannelHealth {
    channel_name: String,
    error: Mutex<Option<String>>,
}

impl ChannelHealth {
    fn new(channel_name: String) -> Self {
        ChannelHealth {
            channel_name,
            error: Mutex::new(None),
        }
    }

    fn record_error(
        &self,
        message: String,
    ) {
        log::error!("Channel '{}' terminated: {}", self.channel_name, message);
        let mut error = self.error.lock().unwrap();
        if error.is_none() {
            *error = Some(message);
        }
    }

    fn check(&self) -> SchedulerResult<()> {
        match &*self.error.lock().unwrap() {
            Some(message) => Err(SchedulerError::ChannelTerminated {
                channel: self.channel_name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn run_channel_loop(
    channel: &mut dyn WorkerChannel,
    finish_rx: &Receiver<()>,
) -> SchedulerResult<()> {
    loop {
        let in_flight = channel.compiling_loop()?;
        let wait = if in_flight == 0 { IDLE_WAIT } else { BUSY_WAIT };
        crossbeam_channel::select! {
            recv(finish_rx) -> _msg => return Ok(()),
            default(wait) => {}
        }
    }
}

// A channel driven by its own thread until it is told to finish or fails
pub(crate) struct ChannelThread {
    name: String,
    kind: ChannelKind,
    stats: Arc<ChannelStats>,
    health: Arc<ChannelHealth>,
    finish_tx: Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl ChannelThread {
    fn spawn(mut channel: Box<dyn WorkerChannel>) -> SchedulerResult<Self> {
        let name = channel.name().to_string();
        let kind = channel.kind();
        let stats = channel.stats();
        let health = Arc::new(ChannelHealth::new(name.clone()));
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);

        let thread_health = health.clone();
        let thread_name = format!("kiln channel {}", name);
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    run_channel_loop(&mut *channel, &finish_rx)
                }));

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => thread_health.record_error(e.to_string()),
                    Err(panic) => thread_health
                        .record_error(format!("Channel panicked: {}", panic_message(&panic))),
                }

                channel.shutdown();
            })?;

        Ok(ChannelThread {
            name,
            kind,
            stats,
            health,
            finish_tx,
            join_handle: Some(join_handle),
        })
    }

    fn stop(&mut self) {
        let _ = self.finish_tx.send(());
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("Thread for channel '{}' panicked while stopping", self.name);
            }
        }
    }
}

// A channel ticked from the manager's polling loop
pub(crate) struct CooperativeChannel {
    channel: Box<dyn WorkerChannel>,
    stats: Arc<ChannelStats>,
    health: ChannelHealth,
}

impl CooperativeChannel {
    fn new(channel: Box<dyn WorkerChannel>) -> Self {
        CooperativeChannel {
            stats: channel.stats(),
            health: ChannelHealth::new(channel.name().to_string()),
            channel,
        }
    }

    fn tick(&mut self) -> SchedulerResult<usize> {
        self.health.check()?;
        let channel = &mut self.channel;
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| channel.compiling_loop()));
        match result {
            Ok(Ok(in_flight)) => Ok(in_flight),
            Ok(Err(e)) => {
                self.health.record_error(e.to_string());
                self.health.check().map(|_| 0)
            }
            Err(panic) => {
                self.health
                    .record_error(format!("Channel panicked: {}", panic_message(&panic)));
                self.health.check().map(|_| 0)
            }
        }
    }
}

/// Owns a channel and decides how it is pumped
pub(crate) enum ChannelRunner {
    Threaded(ChannelThread),
    Cooperative(CooperativeChannel),
}

impl ChannelRunner {
    pub(crate) fn new(
        channel: Box<dyn WorkerChannel>,
        allow_threads: bool,
    ) -> SchedulerResult<Self> {
        if allow_threads && !channel.requires_cooperative_ticking() {
            Ok(ChannelRunner::Threaded(ChannelThread::spawn(channel)?))
        } else {
            Ok(ChannelRunner::Cooperative(CooperativeChannel::new(channel)))
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            ChannelRunner::Threaded(thread) => &thread.name,
            ChannelRunner::Cooperative(cooperative) => cooperative.channel.name(),
        }
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        match self {
            ChannelRunner::Threaded(thread) => thread.kind,
            ChannelRunner::Cooperative(cooperative) => cooperative.channel.kind(),
        }
    }

    pub(crate) fn stats(&self) -> &Arc<ChannelStats> {
        match self {
            ChannelRunner::Threaded(thread) => &thread.stats,
            ChannelRunner::Cooperative(cooperative) => &cooperative.stats,
        }
    }

    pub(crate) fn is_threaded(&self) -> bool {
        matches!(self, ChannelRunner::Threaded(_))
    }

    pub(crate) fn check_health(&self) -> SchedulerResult<()> {
        match self {
            ChannelRunner::Threaded(thread) => thread.health.check(),
            ChannelRunner::Cooperative(cooperative) => cooperative.health.check(),
        }
    }

    /// Runs one pass of a cooperative channel. Threaded channels pump themselves.
    pub(crate) fn tick(&mut self) -> SchedulerResult<usize> {
        match self {
            ChannelRunner::Threaded(thread) => thread.health.check().map(|_| 0),
            ChannelRunner::Cooperative(cooperative) => cooperative.tick(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        match self {
            ChannelRunner::Threaded(thread) => thread.stop(),
            ChannelRunner::Cooperative(cooperative) => cooperative.channel.shutdown(),
        }
    }
}
