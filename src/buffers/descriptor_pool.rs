use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, trace};
use crate::buffers::descriptor::{IoDescriptor, OpKind};

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("no descriptor available: {outstanding} of {limit} descriptors are outstanding")]
pub struct NoResources {
    pub outstanding: usize,
    pub limit: usize,
}

/// Every live descriptor holds a lease. Dropping the lease (i.e. the descriptor) returns it to
///  the pool's outstanding count, whether or not the descriptor went through
///  [DescriptorPool::release].
pub(crate) struct DescriptorLease {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for DescriptorLease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Allocates [IoDescriptor]s and recycles their buffers.
///
/// Buffers of the regular size are cached on release and handed out again on allocation, up to a
///  configured number of cached buffers. The pool also counts outstanding descriptors; if it is
///  created with a limit, allocation beyond that limit fails with [NoResources] rather than
///  growing without bound.
pub struct DescriptorPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
    outstanding: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl DescriptorPool {
    pub fn new(buf_size: usize, max_pool_size: usize, limit: Option<usize>) -> Self {
        DescriptorPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            outstanding: Default::default(),
            limit,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// the number of descriptors that are currently allocated and not yet dropped or released
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn allocate(&self, kind: OpKind, capacity: usize) -> Result<IoDescriptor, NoResources> {
        let lease = self.acquire_lease()?;
        Ok(IoDescriptor::new(kind, self.get_buffer(capacity), capacity, lease))
    }

    /// Recycles the descriptor's buffer. The descriptor must not be referenced by an operation
    ///  that is still in flight - ownership guarantees this, since in-flight descriptors are
    ///  owned by the socket layer.
    pub fn release(&self, mut descriptor: IoDescriptor) {
        let buf = descriptor.take_buffer();
        self.return_buffer(buf);
    }

    /// Replaces a descriptor's buffer (which was moved out e.g. to echo its data) with a fresh
    ///  buffer of the regular size, making it ready to be posted for a receive again.
    pub fn refill(&self, descriptor: &mut IoDescriptor) {
        let buf = self.get_buffer(self.buf_size);
        descriptor.put_buffer(buf, self.buf_size);
    }

    fn acquire_lease(&self) -> Result<DescriptorLease, NoResources> {
        let result = self.outstanding.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            match self.limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            }
        });

        match result {
            Ok(_) => Ok(DescriptorLease { outstanding: self.outstanding.clone() }),
            Err(outstanding) => {
                debug!("descriptor limit reached with {} outstanding descriptors", outstanding);
                Err(NoResources {
                    outstanding,
                    limit: self.limit.unwrap_or(outstanding),
                })
            }
        }
    }

    fn get_buffer(&self, capacity: usize) -> BytesMut {
        if capacity == self.buf_size {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        trace!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(capacity)
    }

    fn return_buffer(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            // send descriptors for accept data have custom sizes
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            trace!("pool is full: discarding returned buffer");
        }
    }
}
