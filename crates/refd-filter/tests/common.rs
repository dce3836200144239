//! Shared fixtures for the end-to-end scenarios.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use refd_filter::channel::{ConsumerPort, Message};
use refd_filter::config::FilterConfig;
use refd_filter::pipeline::Pipeline;
use refd_filter::record::EventRecord;
use refd_filter::request::{Access, CreateDisposition, CreateParams};
use refd_filter::volume::{LocalHost, LocalVolume};
use tempfile::TempDir;

pub const PID: u32 = 4242;

/// A started pipeline over a temporary directory, with a queued consumer.
pub struct TestVolume {
    pub dir: TempDir,
    pub volume: LocalVolume,
    pub port: Option<ConsumerPort>,
}

impl TestVolume {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut FilterConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = FilterConfig::with_backup_root(dir.path().join("backups"));
        config.channel.queue_depth = 64;
        config.channel.send_timeout_ms = 200;
        tweak(&mut config);

        let pipeline = Pipeline::builder(config, Arc::new(LocalHost::new()))
            .build()
            .unwrap();
        pipeline.start().unwrap();
        let port = Some(pipeline.connect().unwrap());

        Self {
            dir,
            volume: LocalVolume::new(Arc::new(pipeline)),
            port,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.volume.pipeline()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join("data").join(name)
    }

    /// Creates `name` under the data directory with `contents`.
    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn disconnect(&mut self) {
        self.port = None;
    }

    /// Every full record delivered so far.
    pub fn events(&self) -> Vec<EventRecord> {
        let port = self.port.as_ref().expect("consumer connected");
        let mut events = Vec::new();
        // A host-side disconnect still leaves queued records readable.
        while let Ok(Some(message)) = port.try_recv() {
            if let Message::Event(record) = message {
                events.push(record);
            }
        }
        events
    }
}

pub fn read_write() -> CreateParams {
    CreateParams {
        access: Access::read_write(),
        ..CreateParams::default()
    }
}

pub fn create_new(delete_on_close: bool) -> CreateParams {
    CreateParams {
        access: Access::read_write(),
        disposition: CreateDisposition::Create,
        delete_on_close,
        ..CreateParams::default()
    }
}

pub fn delete_access() -> CreateParams {
    CreateParams {
        access: Access::delete(),
        ..CreateParams::default()
    }
}
