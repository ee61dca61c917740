//! Per-node port handles wrapping channels.
//!
//! A port binds one direction and index on a node to the channel backing the
//! edge, re-exporting the channel's primitives. Ports are the only path node
//! logic uses to touch channels.

use std::sync::{Arc, Mutex};

use crate::channel::{lock, Channel};
use crate::errors::ChannelError;
use crate::record::Record;

/// Reading end of an edge, held by the consumer node.
#[derive(Clone)]
pub struct InputPort {
    index: usize,
    channel: Arc<dyn Channel>,
}

impl InputPort {
    pub(crate) fn new(index: usize, channel: Arc<dyn Channel>) -> Self {
        Self { index, channel }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Next record in write order, or `None` at end of stream.
    pub fn read(&self) -> Result<Option<Record>, ChannelError> {
        self.channel.read_record()
    }

    /// Next record as raw bytes.
    pub fn read_raw(&self) -> Result<Option<bytes::Bytes>, ChannelError> {
        self.channel.read_raw()
    }

    /// Whether a read would return without blocking.
    pub fn has_data(&self) -> bool {
        self.channel.has_data()
    }

    pub fn is_eos(&self) -> bool {
        self.channel.is_eos()
    }

    /// Records read through this port so far.
    pub fn records_read(&self) -> u64 {
        self.channel.counters().records_read()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

/// Writing end of an edge, held by the producer node.
#[derive(Clone)]
pub struct OutputPort {
    index: usize,
    channel: Arc<dyn Channel>,
}

impl OutputPort {
    pub(crate) fn new(index: usize, channel: Arc<dyn Channel>) -> Self {
        Self { index, channel }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn write(&self, record: Record) -> Result<(), ChannelError> {
        self.channel.write_record(record)
    }

    pub fn write_raw(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.channel.write_raw(data)
    }

    /// Mark this port's stream complete.
    pub fn signal_eos(&self) -> Result<(), ChannelError> {
        self.channel.signal_eos()
    }

    /// Records written through this port so far.
    pub fn records_written(&self) -> u64 {
        self.channel.counters().records_written()
    }

    pub fn bytes_written(&self) -> u64 {
        self.channel.counters().bytes_written()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

/// Serializing decorator for the rare case several threads legally share one
/// output port, such as a broadcast fan-out writing from worker threads. The
/// underlying channel still sees a single logical writer: the mutex imposes a
/// total order on writes.
pub struct ConcurrentOutputPort {
    inner: Mutex<OutputPort>,
}

impl ConcurrentOutputPort {
    pub fn new(port: OutputPort) -> Self {
        Self {
            inner: Mutex::new(port),
        }
    }

    pub fn write(&self, record: Record) -> Result<(), ChannelError> {
        lock(&self.inner).write(record)
    }

    pub fn signal_eos(&self) -> Result<(), ChannelError> {
        lock(&self.inner).signal_eos()
    }
}

/// Serializing decorator for a shared input port.
pub struct ConcurrentInputPort {
    inner: Mutex<InputPort>,
}

impl ConcurrentInputPort {
    pub fn new(port: InputPort) -> Self {
        Self {
            inner: Mutex::new(port),
        }
    }

    pub fn read(&self) -> Result<Option<Record>, ChannelError> {
        lock(&self.inner).read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::config::EngineConfig;
    use std::thread;

    fn ports() -> (OutputPort, InputPort) {
        let config = EngineConfig::default();
        let channel = ChannelKind::FastPropagate.create(&config);
        channel.init().unwrap();
        channel.open();
        (
            OutputPort::new(0, Arc::clone(&channel)),
            InputPort::new(0, channel),
        )
    }

    #[test]
    fn ports_pass_records_through_the_shared_channel() {
        let (out, inp) = ports();
        out.write(Record::copy_from_slice(b"a")).unwrap();
        out.signal_eos().unwrap();
        assert_eq!(inp.read().unwrap(), Some(Record::copy_from_slice(b"a")));
        assert_eq!(inp.read().unwrap(), None);
        assert_eq!(out.records_written(), 1);
        assert_eq!(inp.records_read(), 1);
    }

    #[test]
    fn concurrent_port_serializes_writers() {
        let (out, inp) = ports();
        let shared = Arc::new(ConcurrentOutputPort::new(out));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let port = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..50 {
                        port.write(Record::copy_from_slice(b"x")).unwrap();
                    }
                })
            })
            .collect();
        let reader = thread::spawn(move || {
            let mut count = 0usize;
            while inp.read().unwrap().is_some() {
                count += 1;
            }
            count
        });
        for handle in handles {
            handle.join().unwrap();
        }
        shared.signal_eos().unwrap();
        assert_eq!(reader.join().unwrap(), 200);
    }

    #[test]
    fn concurrent_input_port_splits_the_stream_between_readers() {
        let (out, inp) = ports();
        for n in 0..4u32 {
            out.write(Record::copy_from_slice(&n.to_le_bytes())).unwrap();
        }
        out.signal_eos().unwrap();
        let shared = Arc::new(ConcurrentInputPort::new(inp));
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let port = Arc::clone(&shared);
                thread::spawn(move || {
                    let mut count = 0usize;
                    while port.read().unwrap().is_some() {
                        count += 1;
                    }
                    count
                })
            })
            .collect();
        let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 4);
    }
}
