//! Framed, per-block-deflated byte container for persisting the index.
//!
//! The stream is a sequence of `"PG00" | len:u32 LE | <len deflated
//! bytes>` frames holding 1 MiB of payload each, terminated by a frame
//! whose length field is `0xFFFF_FFFF`. Blocks are zlib-compressed at
//! level 1; compression and decompression run on a small pool of worker
//! threads and frames are re-emitted in block-id order, so the logical
//! byte stream is independent of the thread count.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use log::trace;

use crate::error::LramError;
use crate::pipeline::{OrderedDrain, Pipeline};

/// Uncompressed payload bytes per block.
pub const BLOCK_SIZE: usize = 1024 * 1024;

pub const MAGIC: [u8; 4] = *b"PG00";
const TERMINATOR: u32 = 0xffff_ffff;

type BlockResult = (u64, Result<Vec<u8>, String>);

fn deflate_block(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut enc = ZlibEncoder::new(data, Compression::new(1));
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    enc.read_to_end(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

fn inflate_block(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut dec = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(BLOCK_SIZE);
    dec.read_to_end(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

fn spawn_workers(
    nth: usize,
    deflate: bool,
) -> (Sender<(u64, Vec<u8>)>, Receiver<BlockResult>, Vec<JoinHandle<()>>) {
    let (job_tx, job_rx) = bounded::<(u64, Vec<u8>)>(16 * nth);
    let (res_tx, res_rx) = bounded::<BlockResult>(16 * nth);
    let mut workers = Vec::with_capacity(nth);
    for _ in 0..nth {
        let job_rx = job_rx.clone();
        let res_tx = res_tx.clone();
        workers.push(std::thread::spawn(move || {
            for (id, data) in job_rx.iter() {
                let done = if deflate {
                    deflate_block(&data)
                } else {
                    inflate_block(&data)
                };
                if res_tx.send((id, done)).is_err() {
                    break;
                }
            }
        }));
    }
    (job_tx, res_rx, workers)
}

/// Writer half of the container; implements [`std::io::Write`].
///
/// Call [`ContainerWriter::finish`] to flush the last partial block and
/// write the terminator; dropping without finishing only makes a
/// best-effort attempt and swallows errors.
pub struct ContainerWriter<W: Write> {
    inner: Option<W>,
    buf: Vec<u8>,
    nth: usize,
    next_id: u64,
    bal: usize,
    hq: OrderedDrain<Vec<u8>>,
    job_tx: Option<Sender<(u64, Vec<u8>)>>,
    res_rx: Option<Receiver<BlockResult>>,
    workers: Vec<JoinHandle<()>>,
    poisoned: bool,
    finished: bool,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(inner: W, pt: &Pipeline) -> Self {
        let nth = pt.nth();
        let (job_tx, res_rx, workers) = if nth > 1 {
            let (tx, rx, ws) = spawn_workers(nth, true);
            (Some(tx), Some(rx), ws)
        } else {
            (None, None, Vec::new())
        };
        Self {
            inner: Some(inner),
            buf: Vec::with_capacity(BLOCK_SIZE),
            nth,
            next_id: 0,
            bal: 0,
            hq: OrderedDrain::new(),
            job_tx,
            res_rx,
            workers,
            poisoned: false,
            finished: false,
        }
    }

    fn write_frame(&mut self, z: &[u8]) -> crate::Result<()> {
        let inner = self.inner.as_mut().expect("writer already finished");
        inner.write_all(&MAGIC)?;
        inner.write_all(&(z.len() as u32).to_le_bytes())?;
        inner.write_all(z)?;
        Ok(())
    }

    fn collect_one(&mut self, timeout: Duration) -> crate::Result<bool> {
        let rx = self.res_rx.as_ref().expect("no workers");
        match rx.recv_timeout(timeout) {
            Ok((id, Ok(z))) => {
                self.bal -= 1;
                self.hq.push(id, z);
                Ok(true)
            }
            Ok((_, Err(e))) => {
                self.bal -= 1;
                Err(LramError::DeflateError(e))
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(LramError::ThreadError(
                "container compressor threads exited early".to_string(),
            )),
        }
    }

    /// Hand the full buffer to the compressors (or compress inline) and
    /// emit whatever frames are ready in id order.
    fn dispatch(&mut self) -> crate::Result<()> {
        let data = std::mem::take(&mut self.buf);
        self.buf.reserve(BLOCK_SIZE);
        if data.is_empty() {
            return Ok(());
        }
        let id = self.next_id;
        self.next_id += 1;

        if self.nth <= 1 {
            let z = deflate_block(&data).map_err(LramError::DeflateError)?;
            return self.write_frame(&z);
        }

        self.job_tx
            .as_ref()
            .expect("no workers")
            .send((id, data))
            .map_err(|_| {
                LramError::ThreadError("container compressor threads exited early".to_string())
            })?;
        self.bal += 1;

        // keep at most 3*nth blocks in flight
        while self.bal > 3 * self.nth {
            self.collect_one(Duration::from_millis(2))?;
        }
        while self.bal > self.nth && self.collect_one(Duration::ZERO)? {}
        while let Some(z) = self.hq.pop_ready() {
            self.write_frame(&z)?;
        }
        Ok(())
    }

    fn finish_inner(&mut self) -> crate::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if !self.poisoned {
            self.dispatch()?;
            while self.bal > 0 {
                self.collect_one(Duration::from_millis(2))?;
                while let Some(z) = self.hq.pop_ready() {
                    self.write_frame(&z)?;
                }
            }
            // terminator
            let inner = self.inner.as_mut().expect("writer already finished");
            inner.write_all(&MAGIC)?;
            inner.write_all(&TERMINATOR.to_le_bytes())?;
            inner.flush()?;
        }
        self.job_tx.take(); // disconnect; workers drain and exit
        if let Some(rx) = self.res_rx.take() {
            for _ in rx.iter() {}
        }
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
        Ok(())
    }

    /// Flush everything, write the terminator, and return the underlying
    /// writer.
    pub fn finish(mut self) -> crate::Result<W> {
        self.finish_inner()?;
        Ok(self.inner.take().expect("writer already finished"))
    }
}

impl<W: Write> Write for ContainerWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::other("container writer is poisoned"));
        }
        let mut rem = data;
        while !rem.is_empty() {
            let room = BLOCK_SIZE - self.buf.len();
            let take = room.min(rem.len());
            self.buf.extend_from_slice(&rem[..take]);
            rem = &rem[take..];
            if self.buf.len() == BLOCK_SIZE {
                if let Err(e) = self.dispatch() {
                    self.poisoned = true;
                    return Err(io::Error::other(e));
                }
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // partial blocks are only framed at finish time
        match self.inner.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for ContainerWriter<W> {
    fn drop(&mut self) {
        let _ = self.finish_inner();
    }
}

/// Reader half of the container; implements [`std::io::Read`].
///
/// Reads past the terminator frame report end of file; a malformed
/// stream poisons the reader and every subsequent read fails.
pub struct ContainerReader<R: Read> {
    inner: R,
    nth: usize,
    /// Current inflated block being served.
    cur: Vec<u8>,
    cur_pos: usize,
    /// Inflated blocks ready to serve, in id order.
    ready: VecDeque<Vec<u8>>,
    hq: OrderedDrain<Vec<u8>>,
    next_id: u64,
    bal: usize,
    job_tx: Option<Sender<(u64, Vec<u8>)>>,
    res_rx: Option<Receiver<BlockResult>>,
    workers: Vec<JoinHandle<()>>,
    /// 0 = streaming, 1 = terminator seen, 2 = poisoned
    eof: u8,
}

impl<R: Read> ContainerReader<R> {
    pub fn new(inner: R, pt: &Pipeline) -> Self {
        let nth = pt.nth();
        let (job_tx, res_rx, workers) = if nth > 1 {
            let (tx, rx, ws) = spawn_workers(nth, false);
            (Some(tx), Some(rx), ws)
        } else {
            (None, None, Vec::new())
        };
        Self {
            inner,
            nth,
            cur: Vec::new(),
            cur_pos: 0,
            ready: VecDeque::new(),
            hq: OrderedDrain::new(),
            next_id: 0,
            bal: 0,
            job_tx,
            res_rx,
            workers,
            eof: 0,
        }
    }

    /// Read one frame; `Ok(None)` once the terminator has been seen.
    fn read_frame(&mut self) -> crate::Result<Option<Vec<u8>>> {
        if self.eof != 0 {
            return Ok(None);
        }
        let mut magic = [0u8; 4];
        self.inner.read_exact(&mut magic).map_err(|e| {
            self.eof = 2;
            LramError::Truncated(format!("container ended without a terminator: {e}"))
        })?;
        if magic != MAGIC {
            self.eof = 2;
            return Err(LramError::BadMagic(format!(
                "container block magic {:02x?} is not {:02x?}",
                magic, MAGIC
            )));
        }
        let mut len = [0u8; 4];
        self.inner
            .read_exact(&mut len)
            .map_err(|e| {
                self.eof = 2;
                LramError::Truncated(e.to_string())
            })?;
        let len = u32::from_le_bytes(len);
        if len == TERMINATOR {
            self.eof = 1;
            return Ok(None);
        }
        let mut data = vec![0u8; len as usize];
        self.inner.read_exact(&mut data).map_err(|e| {
            self.eof = 2;
            LramError::Truncated(format!(
                "container block declared {len} bytes past the end of the stream: {e}"
            ))
        })?;
        Ok(Some(data))
    }

    /// Refill `cur` with the next inflated block in id order.
    fn next_block(&mut self) -> crate::Result<bool> {
        if let Some(block) = self.ready.pop_front() {
            self.cur = block;
            self.cur_pos = 0;
            return Ok(true);
        }

        if self.nth <= 1 {
            return match self.read_frame()? {
                Some(data) => {
                    self.cur = inflate_block(&data).map_err(LramError::DeflateError)?;
                    self.cur_pos = 0;
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        // keep the decompressors fed
        while self.bal < 3 * self.nth {
            match self.read_frame()? {
                Some(data) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.job_tx
                        .as_ref()
                        .expect("no workers")
                        .send((id, data))
                        .map_err(|_| {
                            LramError::ThreadError(
                                "container decompressor threads exited early".to_string(),
                            )
                        })?;
                    self.bal += 1;
                }
                None => break,
            }
        }
        if self.bal == 0 {
            return Ok(false); // fully drained
        }

        // wait until the next in-order block arrives
        loop {
            let rx = self.res_rx.as_ref().expect("no workers");
            match rx.recv_timeout(Duration::from_millis(2)) {
                Ok((id, Ok(block))) => {
                    self.bal -= 1;
                    self.hq.push(id, block);
                }
                Ok((_, Err(e))) => {
                    self.bal -= 1;
                    self.eof = 2;
                    return Err(LramError::DeflateError(e));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.eof = 2;
                    return Err(LramError::ThreadError(
                        "container decompressor threads exited early".to_string(),
                    ));
                }
            }
            let mut got = false;
            while let Some(block) = self.hq.pop_ready() {
                self.ready.push_back(block);
                got = true;
            }
            if got {
                break;
            }
        }
        self.cur = self.ready.pop_front().expect("a block just arrived");
        self.cur_pos = 0;
        trace!("container block served, {} queued", self.ready.len());
        Ok(true)
    }
}

impl<R: Read> Read for ContainerReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < out.len() {
            if self.cur_pos == self.cur.len() {
                match self.next_block() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => return Err(io::Error::other(e)),
                }
            }
            let n = (out.len() - filled).min(self.cur.len() - self.cur_pos);
            out[filled..filled + n].copy_from_slice(&self.cur[self.cur_pos..self.cur_pos + n]);
            self.cur_pos += n;
            filled += n;
        }
        Ok(filled)
    }
}

impl<R: Read> Drop for ContainerReader<R> {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(rx) = self.res_rx.take() {
            for _ in rx.iter() {}
        }
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
    }
}
