//! IPC message format
//!
//! A message is a bounded byte payload plus a bounded list of descriptors
//! to transfer, a user-defined function number and the cookie of the
//! capability the sender invoked. Each thread owns one staging buffer; a
//! message is copied from the sender's buffer to the receiver's at
//! rendezvous, so it is observed exactly once and in its entirety.

use crate::error::{Errno, KernelResult};

/// Maximum payload bytes per message
pub const MESSAGE_MAX_SIZE: usize = 2048;

/// Maximum descriptors transferred per message
pub const MESSAGE_MAX_DESCRIPTORS: usize = 255;

/// A message as submitted by a sender or replier
#[derive(Debug, Clone, Copy)]
pub struct MessageInput<'a> {
    /// Payload bytes, at most [`MESSAGE_MAX_SIZE`]
    pub data: &'a [u8],
    /// Sender-side descriptor numbers to transfer
    pub descriptors: &'a [usize],
    /// Capacity of the sender's reply buffer; a reply larger than this
    /// fails with `E2BIG`
    pub reply_capacity: usize,
}

impl<'a> MessageInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            descriptors: &[],
            reply_capacity: MESSAGE_MAX_SIZE,
        }
    }

    pub fn with_descriptors(mut self, descriptors: &'a [usize]) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = capacity;
        self
    }

    /// Size validation; runs before any side effect of a send.
    pub fn validate(&self) -> KernelResult<()> {
        if self.data.len() > MESSAGE_MAX_SIZE {
            return Err(Errno::TooBig);
        }
        if self.descriptors.len() > MESSAGE_MAX_DESCRIPTORS {
            return Err(Errno::Invalid);
        }
        Ok(())
    }
}

/// Per-thread message staging buffer
///
/// Holds the outgoing message while a sender is parked and the delivered
/// message when a receiver resumes. After a transfer the descriptor slots
/// hold receiver-side descriptor numbers.
pub struct MessageBuffer {
    pub function: usize,
    pub cookie: usize,
    pub data: [u8; MESSAGE_MAX_SIZE],
    pub data_size: usize,
    /// Descriptor numbers are small; 32 bits keeps the buffer (and with it
    /// the thread object) within one slab page
    pub descriptors: [u32; MESSAGE_MAX_DESCRIPTORS],
    pub descriptor_count: usize,
    pub reply_capacity: usize,
}

impl MessageBuffer {
    pub const fn new() -> Self {
        Self {
            function: 0,
            cookie: 0,
            data: [0; MESSAGE_MAX_SIZE],
            data_size: 0,
            descriptors: [0; MESSAGE_MAX_DESCRIPTORS],
            descriptor_count: 0,
            reply_capacity: 0,
        }
    }

    /// Stage an outgoing message. The input must already be validated.
    pub fn stage(&mut self, function: usize, cookie: usize, input: &MessageInput<'_>) {
        debug_assert!(input.validate().is_ok());

        self.function = function;
        self.cookie = cookie;
        self.data_size = input.data.len();
        self.data[..input.data.len()].copy_from_slice(input.data);
        self.descriptor_count = input.descriptors.len();
        for (slot, &fd) in self.descriptors.iter_mut().zip(input.descriptors) {
            *slot = fd as u32;
        }
        self.reply_capacity = input.reply_capacity;
    }

    /// The staged payload
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    /// The staged descriptor numbers
    pub fn descriptor_slots(&self) -> &[u32] {
        &self.descriptors[..self.descriptor_count]
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
