use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use may::queue::mpsc::Queue;
use may::sync::Mutex;

#[derive(Debug)]
struct BufWriter<W: Write> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write> BufWriter<W> {
    fn new(writer: W) -> Self {
        BufWriter {
            writer,
            buf: BytesMut::with_capacity(1024 * 32),
        }
    }

    #[inline]
    fn put_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data)
    }

    // returns the flushed batch size
    #[inline]
    fn flush_all(&mut self) -> io::Result<usize> {
        let len = self.buf.len();
        let ret = self.writer.write_all(&self.buf);
        self.buf.clear();
        ret.map(|_| len)
    }
}

/// batching writer, one stream shared by many concurrent writers
#[derive(Debug)]
pub(crate) struct QueuedWriter<W: Write> {
    data_count: AtomicUsize,
    data_queue: Queue<Vec<u8>>,
    writer: Mutex<BufWriter<W>>,
    broken: AtomicBool,
}

impl<W: Write> QueuedWriter<W> {
    pub fn new(writer: W) -> Self {
        QueuedWriter {
            data_count: AtomicUsize::new(0),
            data_queue: Queue::new(),
            writer: Mutex::new(BufWriter::new(writer)),
            broken: AtomicBool::new(false),
        }
    }

    /// queue `data`, the first concurrent writer flushes for everybody
    ///
    /// returns the size of the batch this call flushed, 0 when another
    /// writer took care of it.
    pub fn write(&self, data: Vec<u8>) -> io::Result<usize> {
        if self.broken.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer is broken"));
        }
        self.data_queue.push(data);
        // only allow the first writer perform the write operation
        // other concurrent writers would just push the data
        if self.data_count.fetch_add(1, Ordering::AcqRel) != 0 {
            return Ok(0);
        }

        // in any cases this should not block since we have only one writer
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let mut cnt = 0;
            while let Some(data) = self.data_queue.pop() {
                writer.put_data(&data);
                cnt += 1;
            }

            // detect if there are more packet need to deal with
            if self.data_count.fetch_sub(cnt, Ordering::AcqRel) == cnt {
                break;
            }
        }

        writer.flush_all().map_err(|e| {
            error!("QueuedWriter failed, err={e}");
            self.broken.store(true, Ordering::Release);
            e
        })
    }
}
