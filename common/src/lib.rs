// Lets `#[derive(Named)]` refer to `common::` from inside this crate's own tests
extern crate self as common;

use std::sync::{Arc, mpsc::{self, SyncSender, Receiver}};

pub mod cli;
pub mod util;
mod enum_map;
mod named;

pub use enum_map::{EnumMap, EnumMapIterator};
pub use named::{MakeNamed, NamedIterator};
pub use named_derive::Named;

/// Kicks an instance out of any blocking wait so it notices a pending `ControlMessage`
pub type Waker = Arc<dyn Fn() + Send + Sync>;

pub enum UpdateMessage {
    Paused,
    Finished,
}

#[derive(Debug)]
pub enum ControlMessage {
    Pause,
    Stop,
}

/// Why `Instance::run` returned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stopped {
    /// A `ControlMessage::Pause` was honoured, `run` may be called again
    Paused,
    /// The instance ran out of work or was told to stop
    Finished,
}

/// Synchronous instance of an emulated machine
pub trait Instance : Send {
    fn run(&mut self,
        control_rx: &mpsc::Receiver<ControlMessage>,
        update: mpsc::SyncSender<UpdateMessage>
    ) -> Result<Stopped, anyhow::Error>;

    fn waker(&self) -> Waker {
        Arc::new(|| {})
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Running,
    Paused,
    Finished,
    Error,
}

// Asynchronous instance of an emulated machine
pub trait ThreaddedInstance {
    fn start(&mut self) -> Result<(), anyhow::Error>;
    fn pause(&mut self) -> Result<(), anyhow::Error>;
    fn stop(&mut self) -> Result<Box<dyn Instance + Send>, anyhow::Error>;
    fn status(&self) -> Status;
}

/// Takes a raw synchronous Instance and wraps it in a thread
///
/// The instance gets moved to the thread when running and then back to the parent thread when paused.
/// This allows the caller to have full access to the instance while paused without crossing thread
/// boundaries.
pub struct ThreadAdapter {
    instance: Option<Box<dyn Instance + Send>>,
    waker: Waker,
    running: bool,
    finished: bool,
    tx_control: SyncSender<ControlMessage>,
    rx_update: Receiver<UpdateMessage>,
    tx_instance: Option<SyncSender<Box<dyn Instance + Send>>>,
    rx_instance_return: Receiver<Option<Box<dyn Instance + Send>>>,
    join: Option<std::thread::JoinHandle<Result<(), anyhow::Error>>>,
}

impl ThreadAdapter
{
    pub fn new(instance: Box<dyn Instance + Send>) -> Result<Self, anyhow::Error> {
        // Create all our channels
        let (tx_control, rx_control) = mpsc::sync_channel::<ControlMessage>(1);
        let (tx_update, rx_update) = mpsc::sync_channel::<UpdateMessage>(1);
        let (tx_instance, rx_instance) = mpsc::sync_channel::<Box<dyn Instance + Send>>(1);
        let (tx_instance_return, rx_instance_return) = mpsc::sync_channel::<Option<Box<dyn Instance + Send>>>(1);

        let waker = instance.waker();

        // Spawn the thread
        let join = std::thread::Builder::new()
            .name("execution".to_owned())
            .spawn(move || {
                Self::thread_main(
                    rx_instance,
                    tx_instance_return,
                    rx_control,
                    tx_update)
            })?;

        Ok(Self {
            instance: Some(instance),
            waker,
            running: false,
            finished: false,
            tx_control,
            rx_update,
            tx_instance: Some(tx_instance),
            rx_instance_return,
            join: Some(join),
        })
    }

    fn thread_main(
        rx_instance: Receiver<Box<dyn Instance + Send>>,
        tx_instance: SyncSender<Option<Box<dyn Instance + Send>>>,
        rx_control: Receiver<ControlMessage>,
        tx_update: SyncSender<UpdateMessage>
    ) -> Result<(), anyhow::Error> {
        // The loop ends when the adapter drops its sender
        while let Ok(mut instance) = rx_instance.recv() {
            match instance.run(&rx_control, tx_update.clone()) {
                Ok(Stopped::Paused) => {
                    tx_instance.send(Some(instance)).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                }
                Ok(Stopped::Finished) => {
                    // Ignore a full update channel, the instance coming back says the same thing
                    let _ = tx_update.try_send(UpdateMessage::Finished);
                    tx_instance.send(Some(instance)).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("Instance returned error: {:?}", e);
                    tx_instance.send(None).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Blocks until the running instance finishes on its own, then hands it back
    pub fn wait_finished(&mut self) -> Result<Box<dyn Instance + Send>, anyhow::Error> {
        if !self.running {
            return self.instance.take().ok_or_else(|| anyhow::anyhow!("invalid instance state"));
        }
        self.collect()
    }

    fn collect(&mut self) -> Result<Box<dyn Instance + Send>, anyhow::Error> {
        let returned = self.rx_instance_return.recv()?;
        self.running = false;
        // Drain a pending update so the instance never blocks on a full channel next run
        while let Ok(update) = self.rx_update.try_recv() {
            if let UpdateMessage::Finished = update {
                self.finished = true;
            }
        }
        match returned {
            Some(instance) => Ok(instance),
            None => {
                self.finished = true;
                match self.join.take() {
                    Some(join) => {
                        join.join().map_err(|_| anyhow::anyhow!("Instance panicked"))??;
                        Err(anyhow::anyhow!("Instance stopped without returning"))
                    }
                    None => Err(anyhow::anyhow!("invalid instance state")),
                }
            }
        }
    }
}

impl ThreaddedInstance for ThreadAdapter
{
    fn start(&mut self) -> Result<(), anyhow::Error> {
        if self.finished {
            anyhow::bail!("instance already finished");
        }
        let tx = self.tx_instance.as_ref().ok_or_else(|| anyhow::anyhow!("invalid instance state"))?;
        match self.instance.take() {
            Some(instance) => {
                tx.send(instance).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                self.running = true;
                Ok(())
            }
            None => anyhow::bail!("invalid instance state"),
        }
    }

    fn pause(&mut self) -> Result<(), anyhow::Error> {
        if !self.running {
            return Ok(());
        }
        // The instance may already be on its way back, a full control channel is fine then
        let _ = self.tx_control.try_send(ControlMessage::Pause);
        (self.waker)();
        let instance = self.collect()?;
        self.instance = Some(instance);
        Ok(())
    }

    fn stop(&mut self) -> Result<Box<dyn Instance + Send>, anyhow::Error> {
        if self.running {
            let _ = self.tx_control.try_send(ControlMessage::Stop);
            (self.waker)();
            let instance = self.collect()?;
            self.instance = Some(instance);
        }
        self.finished = true;
        // Let the thread fall out of its receive loop
        self.tx_instance.take();
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow::anyhow!("Instance panicked"))??;
        }
        self.instance.take().ok_or_else(|| anyhow::anyhow!("invalid instance state"))
    }

    fn status(&self) -> Status {
        if self.running {
            Status::Running
        } else if self.finished {
            if self.instance.is_some() { Status::Finished } else { Status::Error }
        } else if self.instance.is_some() {
            Status::Paused
        } else {
            Status::Error
        }
    }
}
