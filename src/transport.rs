//! Byte stream abstraction between the protocol engines and the programmer.

use crate::cmd::Result;

/// Transport trait for sending commands to and receiving responses from the
/// programmer.
///
/// There is one command in flight at a time. Implementations block for at
/// most their configured timeout.
pub trait Transport {
    /// Send all of `data`. A short write is an error.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive up to `max_len` bytes.
    ///
    /// May return fewer bytes than requested. A timeout is not an error and
    /// returns an empty vector.
    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        (**self).receive(max_len)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        (**self).receive(max_len)
    }
}
