//! A fake socket for driving the engine by hand: it keeps posted operations instead of
//!  performing them, so tests decide which operation completes when, and with what result.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use crate::buffers::descriptor::IoDescriptor;
use crate::connection::ConnectionId;
use crate::io_port::{PostFailure, SocketIo};
use crate::sequence::Sequence;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentData {
    pub sequence: Option<Sequence>,
    pub payload: Vec<u8>,
    pub peer_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct Recorded {
    receives: Vec<IoDescriptor>,
    accepts: Vec<IoDescriptor>,
    sends: Vec<IoDescriptor>,
    send_log: Vec<SentData>,
    refused_receives: usize,
    closed: bool,
}

#[derive(Default)]
pub struct RecordingSocket {
    recorded: Mutex<Recorded>,
}

impl RecordingSocket {
    pub fn new() -> RecordingSocket {
        Default::default()
    }

    pub fn is_closed(&self) -> bool {
        self.recorded.lock().unwrap().closed
    }

    /// the next `n` posted receives fail synchronously
    pub fn refuse_receives(&self, n: usize) {
        self.recorded.lock().unwrap().refused_receives = n;
    }

    /// sequences of the receives that are currently posted, in post order
    pub fn posted_receive_sequences(&self) -> Vec<Sequence> {
        self.recorded.lock().unwrap().receives.iter()
            .filter_map(|d| d.sequence())
            .collect()
    }

    pub fn posted_receive_connections(&self) -> Vec<Option<ConnectionId>> {
        self.recorded.lock().unwrap().receives.iter()
            .map(|d| d.connection())
            .collect()
    }

    pub fn num_posted_receives(&self) -> usize {
        self.recorded.lock().unwrap().receives.len()
    }

    pub fn take_receive(&self, sequence: Sequence) -> Option<IoDescriptor> {
        let mut recorded = self.recorded.lock().unwrap();
        let idx = recorded.receives.iter().position(|d| d.sequence() == Some(sequence))?;
        Some(recorded.receives.remove(idx))
    }

    /// takes the receive with the given sequence and fills it with data
    pub fn fill_receive(&self, sequence: Sequence, data: &[u8], peer_addr: Option<SocketAddr>) -> Option<IoDescriptor> {
        let mut descriptor = self.take_receive(sequence)?;
        descriptor.receive_buffer()[..data.len()].copy_from_slice(data);
        descriptor.truncate(data.len());
        descriptor.set_peer_addr(peer_addr);
        Some(descriptor)
    }

    pub fn num_posted_accepts(&self) -> usize {
        self.recorded.lock().unwrap().accepts.len()
    }

    pub fn take_accept(&self) -> Option<IoDescriptor> {
        let mut recorded = self.recorded.lock().unwrap();
        if recorded.accepts.is_empty() {
            return None;
        }
        Some(recorded.accepts.remove(0))
    }

    /// the sends that are currently in flight, in post order
    pub fn take_sends(&self) -> Vec<IoDescriptor> {
        std::mem::take(&mut self.recorded.lock().unwrap().sends)
    }

    /// everything that was ever posted for sending, in post order
    pub fn send_log(&self) -> Vec<SentData> {
        self.recorded.lock().unwrap().send_log.clone()
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.send_log().into_iter()
            .map(|s| s.payload)
            .collect()
    }

    pub fn sent_sequences(&self) -> Vec<Sequence> {
        self.send_log().into_iter()
            .filter_map(|s| s.sequence)
            .collect()
    }

    /// takes all operations that are still posted, e.g. to complete them as aborted
    pub fn take_all(&self) -> Vec<IoDescriptor> {
        let mut recorded = self.recorded.lock().unwrap();
        let mut result = std::mem::take(&mut recorded.accepts);
        result.append(&mut recorded.receives);
        result.append(&mut recorded.sends);
        result
    }

    fn check_open(recorded: &Recorded, descriptor: IoDescriptor) -> Result<IoDescriptor, PostFailure> {
        if recorded.closed {
            Err(PostFailure::new(descriptor, io::Error::from(io::ErrorKind::NotConnected)))
        }
        else {
            Ok(descriptor)
        }
    }
}

impl SocketIo for RecordingSocket {
    fn post_receive(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        let mut recorded = self.recorded.lock().unwrap();
        let descriptor = Self::check_open(&recorded, descriptor)?;
        if recorded.refused_receives > 0 {
            recorded.refused_receives -= 1;
            return Err(PostFailure::new(descriptor, io::Error::from(io::ErrorKind::WouldBlock)));
        }
        recorded.receives.push(descriptor);
        Ok(())
    }

    fn post_send(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        let mut recorded = self.recorded.lock().unwrap();
        let descriptor = Self::check_open(&recorded, descriptor)?;
        recorded.send_log.push(SentData {
            sequence: descriptor.sequence(),
            payload: descriptor.payload().to_vec(),
            peer_addr: descriptor.peer_addr(),
        });
        recorded.sends.push(descriptor);
        Ok(())
    }

    fn post_accept(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        let mut recorded = self.recorded.lock().unwrap();
        let descriptor = Self::check_open(&recorded, descriptor)?;
        recorded.accepts.push(descriptor);
        Ok(())
    }

    fn close(&self) {
        self.recorded.lock().unwrap().closed = true;
    }
}
