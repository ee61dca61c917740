//! Batch-handoff channel built on two swapped byte buffers.

use std::sync::{Condvar, Mutex};

use bytes::BytesMut;

use crate::channel::{lock, wait, Channel, ChannelCounters};
use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::{self, Frame, Record};

#[derive(Debug, Default)]
struct DirectState {
    /// Buffer the writer is currently filling.
    write_buf: BytesMut,
    /// Buffer the reader is currently draining.
    read_buf: BytesMut,
    eos_written: bool,
    eos_reached: bool,
    interrupted: bool,
}

/// Double-buffered channel with batch visibility.
///
/// The writer frames records into one buffer while the reader drains the
/// other; when the reader's buffer is empty the two are swapped. The writer
/// blocks only when its buffer is full and the reader has not yet drained the
/// previous batch, which is what gives this variant its throughput: one swap
/// hands over a whole batch of records.
pub struct DirectChannel {
    state: Mutex<DirectState>,
    cond: Condvar,
    buffer_size: usize,
    counters: ChannelCounters,
}

impl DirectChannel {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(DirectState::default()),
            cond: Condvar::new(),
            buffer_size: config.direct_buffer_size,
            counters: ChannelCounters::default(),
        }
    }
}

impl Channel for DirectChannel {
    fn init(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.write_buf = BytesMut::with_capacity(self.buffer_size);
        state.read_buf = BytesMut::with_capacity(self.buffer_size);
        Ok(())
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        state.write_buf.clear();
        state.read_buf.clear();
        state.eos_written = false;
        state.eos_reached = false;
        state.interrupted = false;
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.write_buf = BytesMut::new();
        state.read_buf = BytesMut::new();
    }

    fn write_record(&self, rec: Record) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if state.eos_written {
            return Err(ChannelError::WriteAfterEos);
        }
        // A record that does not fit next to the current batch forces a
        // flush: wait for the reader to take the batch, then start a new one.
        // An oversized record alone in an empty buffer is allowed to grow it.
        if !state.write_buf.is_empty()
            && state.write_buf.len() + rec.framed_len() > self.buffer_size
        {
            while !state.write_buf.is_empty() {
                state = wait(&self.cond, state);
                if state.interrupted {
                    return Err(ChannelError::Interrupted);
                }
            }
        }
        record::encode_record(&mut state.write_buf, &rec);
        self.counters.on_write(rec.len());
        self.cond.notify_all();
        Ok(())
    }

    fn read_record(&self) -> Result<Option<Record>, ChannelError> {
        let mut state = lock(&self.state);
        loop {
            if state.eos_reached {
                return Ok(None);
            }
            match record::decode_record(&mut state.read_buf) {
                Frame::Record(rec) => {
                    self.counters.on_read(rec.len());
                    return Ok(Some(rec));
                }
                Frame::Eos => {
                    state.eos_reached = true;
                    self.cond.notify_all();
                    return Ok(None);
                }
                Frame::Incomplete => {}
            }
            if !state.write_buf.is_empty() {
                // Swap: take the writer's batch, hand back the drained buffer.
                debug_assert!(state.read_buf.is_empty());
                let st = &mut *state;
                std::mem::swap(&mut st.read_buf, &mut st.write_buf);
                self.cond.notify_all();
                continue;
            }
            if state.interrupted {
                return Err(ChannelError::Interrupted);
            }
            state = wait(&self.cond, state);
        }
    }

    fn signal_eos(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if !state.eos_written {
            record::encode_eos(&mut state.write_buf);
            state.eos_written = true;
            self.cond.notify_all();
        }
        Ok(())
    }

    fn has_data(&self) -> bool {
        let state = lock(&self.state);
        record::next_is_record(&state.read_buf)
            || (state.read_buf.is_empty() && record::next_is_record(&state.write_buf))
    }

    fn is_eos(&self) -> bool {
        lock(&self.state).eos_reached
    }

    fn wait_for_eos(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        while !state.eos_written {
            if state.interrupted {
                return Err(ChannelError::Interrupted);
            }
            state = wait(&self.cond, state);
        }
        Ok(())
    }

    fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.interrupted = true;
        self.cond.notify_all();
    }

    fn counters(&self) -> &ChannelCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn channel(buffer_size: usize) -> Arc<DirectChannel> {
        let config = EngineConfig::default().with_direct_buffer_size(buffer_size);
        let ch = Arc::new(DirectChannel::new(&config));
        ch.init().unwrap();
        ch.open();
        ch
    }

    fn rec(n: u32) -> Record {
        Record::from(n.to_le_bytes().to_vec())
    }

    #[test]
    fn streams_records_in_order_across_threads() {
        let ch = channel(64);
        let writer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                for n in 0..500u32 {
                    ch.write_record(rec(n)).unwrap();
                }
                ch.signal_eos().unwrap();
            })
        };
        let mut next = 0u32;
        while let Some(r) = ch.read_record().unwrap() {
            assert_eq!(r, rec(next));
            next += 1;
        }
        assert_eq!(next, 500);
        assert!(ch.is_eos());
        writer.join().unwrap();
    }

    #[test]
    fn reader_takes_over_the_writer_buffer_as_one_batch() {
        let ch = channel(64);
        for n in 0..3u32 {
            ch.write_record(rec(n)).unwrap();
        }
        ch.signal_eos().unwrap();
        // First read swaps the buffers; the rest drain the taken batch.
        for n in 0..3u32 {
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        assert_eq!(ch.read_record().unwrap(), None);
    }

    #[test]
    fn write_after_eos_is_rejected() {
        let ch = channel(64);
        ch.signal_eos().unwrap();
        assert!(matches!(
            ch.write_record(rec(1)),
            Err(ChannelError::WriteAfterEos)
        ));
    }

    #[test]
    fn oversized_record_is_carried_whole() {
        let ch = channel(16);
        let big = Record::from(vec![0xAB; 100]);
        ch.write_record(big.clone()).unwrap();
        ch.signal_eos().unwrap();
        assert_eq!(ch.read_record().unwrap(), Some(big));
        assert_eq!(ch.read_record().unwrap(), None);
    }

    #[test]
    fn interrupt_wakes_a_blocked_reader() {
        let ch = channel(64);
        let reader = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.read_record())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        ch.interrupt();
        assert!(matches!(
            reader.join().unwrap(),
            Err(ChannelError::Interrupted)
        ));
    }

    #[test]
    fn interrupt_wakes_a_blocked_writer() {
        let ch = channel(16);
        // Fill the write buffer and leave the reader idle so the next flush
        // blocks.
        ch.write_record(Record::from(vec![1u8; 12])).unwrap();
        let writer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.write_record(Record::from(vec![2u8; 12])))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        ch.interrupt();
        assert!(matches!(
            writer.join().unwrap(),
            Err(ChannelError::Interrupted)
        ));
    }

    #[test]
    fn wait_for_eos_returns_once_writer_finishes() {
        let ch = channel(64);
        let waiter = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.wait_for_eos())
        };
        ch.write_record(rec(1)).unwrap();
        ch.signal_eos().unwrap();
        waiter.join().unwrap().unwrap();
        assert!(ch.has_data());
    }

    #[test]
    fn counters_reflect_traffic() {
        let ch = channel(64);
        ch.write_record(rec(1)).unwrap();
        ch.write_record(rec(2)).unwrap();
        ch.signal_eos().unwrap();
        ch.read_record().unwrap();
        assert_eq!(ch.counters().records_written(), 2);
        assert_eq!(ch.counters().records_read(), 1);
        assert_eq!(ch.counters().in_flight(), 1);
    }
}
