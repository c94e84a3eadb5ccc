//! 集成测试共用的记录型宿主。

#![allow(dead_code)]

use std::{
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::Mutex;
use strand_cmdlet::{
    CommandHost, HostError,
    records::{ErrorRecord, InformationRecord, ProgressRecord},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Object(u32),
    Error(String),
    Warning(String),
    Verbose(String),
    Debug(String),
    Progress(u8),
    Information(String),
    ShouldProcess(String),
}

/// 宿主调用日志，记录每次调用的线程与事件。
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(ThreadId, Event)>>>,
}

impl Journal {
    pub fn events(&self) -> Vec<Event> {
        self.entries.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.entries.lock().iter().map(|(thread, _)| *thread).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn push(&self, event: Event) {
        self.entries.lock().push((thread::current().id(), event));
    }
}

pub struct RecordingHost {
    journal: Journal,
    approve: bool,
    reject_warnings: bool,
}

impl RecordingHost {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            approve: true,
            reject_warnings: false,
        }
    }

    pub fn denying(mut self) -> Self {
        self.approve = false;
        self
    }

    pub fn rejecting_warnings(mut self) -> Self {
        self.reject_warnings = true;
        self
    }
}

impl CommandHost for RecordingHost {
    type Output = u32;

    fn write_object(&mut self, output: u32) -> Result<(), HostError> {
        self.journal.push(Event::Object(output));
        Ok(())
    }

    fn write_error(&mut self, record: ErrorRecord) -> Result<(), HostError> {
        self.journal.push(Event::Error(record.error_id().to_owned()));
        Ok(())
    }

    fn write_warning(&mut self, message: String) -> Result<(), HostError> {
        if self.reject_warnings {
            return Err(HostError::rejected("warnings are disabled"));
        }
        self.journal.push(Event::Warning(message));
        Ok(())
    }

    fn write_verbose(&mut self, message: String) -> Result<(), HostError> {
        self.journal.push(Event::Verbose(message));
        Ok(())
    }

    fn write_debug(&mut self, message: String) -> Result<(), HostError> {
        self.journal.push(Event::Debug(message));
        Ok(())
    }

    fn write_progress(&mut self, record: ProgressRecord) -> Result<(), HostError> {
        self.journal
            .push(Event::Progress(record.percent_complete().unwrap_or(0)));
        Ok(())
    }

    fn write_information(&mut self, record: InformationRecord) -> Result<(), HostError> {
        self.journal
            .push(Event::Information(record.message().to_owned()));
        Ok(())
    }

    fn should_process(&mut self, target: &str, _action: &str) -> Result<bool, HostError> {
        self.journal.push(Event::ShouldProcess(target.to_owned()));
        Ok(self.approve)
    }
}
