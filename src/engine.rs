//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `engine` module advances blocks through the pack pipeline: a
//! background worker periodically selects the next batch of unpacked
//! blocks, assembles them into a pack, uploads the pack to the object
//! store, and records the result in the database.

use super::core;
use super::database::Database;
use super::store::PackStore;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use failure::{err_msg, Error};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Commands accepted by the packer worker.
enum Command {
    /// Run a cycle now; the channel is signalled once the cycle completes.
    Trigger(Sender<()>),
    /// Run a cycle now, ignoring the minimum pack size.
    Flush(Sender<()>),
    /// Exit the worker loop at the next cycle boundary.
    Stop,
}

///
/// The packer owns a worker thread that runs one pack cycle per interval,
/// or sooner when triggered. A cycle selects the largest prefix of the
/// unpacked queue that satisfies the configured pack sizes, uploads the
/// assembled pack under a fresh object name, and commits the new block
/// states in a single transaction.
///
/// Cycle errors are logged and swallowed; the affected batch remains in the
/// packing state and is retried on the next cycle.
///
pub struct Packer {
    db: Database,
    packs: Arc<PackStore>,
    interval: Duration,
    min_pack_size: u64,
    max_pack_size: u64,
    max_pack_blocks: u64,
    /// Channel to the worker, present while it is running.
    cmd_tx: Mutex<Option<Sender<Command>>>,
    /// Join handle of the worker thread.
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Packer {
    /// Construct a packer with the default configuration.
    pub fn new(db: Database, packs: Arc<PackStore>) -> Self {
        let config: core::Config = Default::default();
        Self {
            db,
            packs,
            interval: config.pack_interval,
            min_pack_size: config.min_pack_size,
            max_pack_size: config.max_pack_size,
            max_pack_blocks: config.max_pack_blocks,
            cmd_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Set the idle period between pack cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the pack size bounds and the block count cap.
    pub fn with_pack_size(mut self, min_size: u64, max_size: u64, max_blocks: u64) -> Self {
        self.min_pack_size = min_size;
        self.max_pack_size = max_size;
        self.max_pack_blocks = max_blocks;
        self
    }

    ///
    /// Start the worker thread. Returns an error if it is already running.
    ///
    pub fn start(&self) -> Result<(), Error> {
        let mut sender = self.cmd_tx.lock().unwrap();
        if sender.is_some() {
            return Err(err_msg("packer is already running"));
        }
        let (cmd_tx, cmd_rx) = unbounded();
        let db = self.db.clone();
        let packs = Arc::clone(&self.packs);
        let interval = self.interval;
        let min_size = self.min_pack_size;
        let max_size = self.max_pack_size;
        let max_blocks = self.max_pack_blocks;
        let hd = thread::Builder::new()
            .name(String::from("packer"))
            .spawn(move || {
                run_worker(db, packs, interval, min_size, max_size, max_blocks, cmd_rx);
            })?;
        *sender = Some(cmd_tx);
        *self.handle.lock().unwrap() = Some(hd);
        Ok(())
    }

    ///
    /// Ask the worker to run a cycle now and wait for that cycle to finish.
    /// Returns once the commit has resolved, whether or not any blocks were
    /// packed. Concurrent callers coalesce onto the same cycle.
    ///
    pub fn trigger_wait(&self) -> Result<(), Error> {
        self.send_and_wait(Command::Trigger)
    }

    ///
    /// Like `trigger_wait()`, but the cycle ignores the minimum pack size
    /// so that even a short queue is drained into a pack. Used on shutdown
    /// and by hosts that want explicit flush semantics.
    ///
    pub fn flush_wait(&self) -> Result<(), Error> {
        self.send_and_wait(Command::Flush)
    }

    fn send_and_wait<F: FnOnce(Sender<()>) -> Command>(&self, command: F) -> Result<(), Error> {
        let (ack_tx, ack_rx) = unbounded();
        {
            let sender = self.cmd_tx.lock().unwrap();
            match sender.as_ref() {
                Some(cmds) => cmds.send(command(ack_tx))?,
                None => return Err(err_msg("packer is not running")),
            }
        }
        ack_rx.recv()?;
        Ok(())
    }

    ///
    /// Stop the worker and wait for it to exit. A cycle in flight runs to
    /// completion first. Stopping a packer that is not running is not an
    /// error.
    ///
    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut sender = self.cmd_tx.lock().unwrap();
            if let Some(cmds) = sender.take() {
                // the worker may have already exited on its own
                let _ = cmds.send(Command::Stop);
            }
        }
        let hd = self.handle.lock().unwrap().take();
        if let Some(hd) = hd {
            hd.join().map_err(|_| err_msg("packer thread panicked"))?;
        }
        Ok(())
    }
}

// Main loop of the worker thread: sleep until the interval elapses or a
// command arrives, run a cycle, and signal anyone waiting on it.
fn run_worker(
    db: Database,
    packs: Arc<PackStore>,
    interval: Duration,
    min_size: u64,
    max_size: u64,
    max_blocks: u64,
    cmd_rx: Receiver<Command>,
) {
    debug!("packer worker started");
    let ticker = tick(interval);
    loop {
        let mut commands: Vec<Command> = Vec::new();
        select! {
            recv(ticker) -> _ => (),
            recv(cmd_rx) -> msg => match msg {
                Ok(cmd) => commands.push(cmd),
                Err(_) => commands.push(Command::Stop),
            }
        }
        // commands that arrived in the meantime attach to this cycle
        commands.extend(cmd_rx.try_iter());
        let mut waiters: Vec<Sender<()>> = Vec::new();
        let mut cycle_min = min_size;
        let mut stopping = false;
        for cmd in commands {
            match cmd {
                Command::Trigger(ack) => waiters.push(ack),
                Command::Flush(ack) => {
                    cycle_min = 1;
                    waiters.push(ack);
                }
                Command::Stop => stopping = true,
            }
        }
        if !stopping {
            match run_cycle(&db, &packs, cycle_min, max_size, max_blocks) {
                Ok(0) => debug!("pack cycle completed with no work"),
                Ok(count) => debug!("pack cycle completed with {} blocks", count),
                // the batch stays in the packing state for the next cycle
                Err(err) => error!("pack cycle failed: {}", err),
            }
        }
        for ack in waiters {
            // a waiter may have given up in the meantime
            let _ = ack.send(());
        }
        if stopping {
            break;
        }
    }
    debug!("packer worker exiting");
}

// Run a single pack cycle: select, assemble, upload, commit. Returns the
// number of blocks packed, zero when the queue was not worth packing.
fn run_cycle(
    db: &Database,
    packs: &PackStore,
    min_size: u64,
    max_size: u64,
    max_blocks: u64,
) -> Result<usize, Error> {
    // A non-empty packing set means an earlier cycle failed after selection;
    // retry exactly that batch before considering anything new, so the pack
    // size bounds of the original selection still hold.
    let mut batch = db.fetch_packing_blocks()?;
    if batch.is_empty() {
        if db.select_next_pack(min_size, max_size, max_blocks)? == 0 {
            return Ok(0);
        }
        batch = db.fetch_packing_blocks()?;
    } else {
        warn!("retrying {} blocks from a previous pack cycle", batch.len());
    }
    // assemble the pack in queue order, recording each block's offset
    let mut buffer: Vec<u8> = Vec::new();
    let mut offsets: Vec<(String, u64)> = Vec::with_capacity(batch.len());
    for (cid, data) in batch {
        let data =
            data.ok_or_else(|| err_msg(format!("block {} in packing state with no data", cid)))?;
        offsets.push((cid, buffer.len() as u64));
        buffer.extend_from_slice(&data);
    }
    let pack_object = core::generate_pack_object();
    packs.store_pack(&pack_object, &buffer)?;
    db.update_packed_blocks(&pack_object, &offsets)?;
    info!(
        "created pack {} with {} blocks ({} bytes)",
        pack_object,
        offsets.len(),
        buffer.len()
    );
    Ok(offsets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PackStatus;
    use crate::store::local::{LocalConfig, LocalStore};
    use crate::store::MockObjectStore;
    use mockall::Sequence;
    use tempfile::tempdir;

    fn local_fixture(outdir: &std::path::Path) -> (Database, Arc<PackStore>) {
        let dbase = Database::new(outdir.join("database.db")).unwrap();
        let store = Box::new(LocalStore::new(LocalConfig {
            basepath: outdir.join("packs").to_string_lossy().into_owned(),
        }));
        let packs = Arc::new(PackStore::new(store, "blocks-bucket"));
        (dbase, packs)
    }

    #[test]
    fn test_packer_packs_blocks() -> Result<(), Error> {
        let outdir = tempdir()?;
        let (dbase, packs) = local_fixture(outdir.path());
        let packer = Packer::new(dbase.clone(), Arc::clone(&packs))
            .with_interval(Duration::from_secs(300))
            .with_pack_size(100, 200, 10);
        packer.start()?;
        dbase.put_block("block-1", &[0x11; 40])?;
        dbase.put_block("block-2", &[0x22; 40])?;
        dbase.put_block("block-3", &[0x33; 40])?;
        packer.trigger_wait()?;
        // all three fit in one pack, and nothing is left in packing
        assert!(dbase.fetch_packing_blocks()?.is_empty());
        let first = dbase.get_block("block-1")?;
        assert_eq!(first.pack_status, PackStatus::PACKED);
        assert!(first.data.is_none());
        assert_eq!(first.pack_offset, 0);
        for cid in &["block-2", "block-3"] {
            let block = dbase.get_block(cid)?;
            assert_eq!(block.pack_status, PackStatus::PACKED);
            assert_eq!(block.pack_object, first.pack_object);
        }
        // the packed bytes are retrievable by range
        let third = dbase.get_block("block-3")?;
        let actual = packs.retrieve_range(&third.pack_object, third.pack_offset, third.size)?;
        assert_eq!(actual, vec![0x33; 40]);
        packer.stop()?;
        Ok(())
    }

    #[test]
    fn test_packer_below_minimum() -> Result<(), Error> {
        let outdir = tempdir()?;
        let (dbase, packs) = local_fixture(outdir.path());
        let packer = Packer::new(dbase.clone(), packs)
            .with_interval(Duration::from_secs(300))
            .with_pack_size(100, 200, 10);
        packer.start()?;
        dbase.put_block("block-1", &[0x11; 40])?;
        dbase.put_block("block-2", &[0x22; 40])?;
        // 80 bytes does not reach the minimum, so nothing happens
        packer.trigger_wait()?;
        assert_eq!(
            dbase.get_block("block-1")?.pack_status,
            PackStatus::UNPACKED
        );
        assert_eq!(
            dbase.get_block("block-2")?.pack_status,
            PackStatus::UNPACKED
        );
        // a flush drains the short queue anyway
        packer.flush_wait()?;
        assert_eq!(dbase.get_block("block-1")?.pack_status, PackStatus::PACKED);
        assert_eq!(dbase.get_block("block-2")?.pack_status, PackStatus::PACKED);
        packer.stop()?;
        Ok(())
    }

    #[test]
    fn test_packer_empty_queue() -> Result<(), Error> {
        let outdir = tempdir()?;
        let (dbase, packs) = local_fixture(outdir.path());
        let packer = Packer::new(dbase, packs).with_interval(Duration::from_secs(300));
        packer.start()?;
        // a cycle with nothing to do still completes the wait
        packer.trigger_wait()?;
        packer.stop()?;
        // stopping twice is fine
        packer.stop()?;
        Ok(())
    }

    #[test]
    fn test_packer_retries_failed_upload() -> Result<(), Error> {
        let outdir = tempdir()?;
        let dbase = Database::new(outdir.path().join("database.db"))?;
        let mut mock = MockObjectStore::new();
        let mut seq = Sequence::new();
        mock.expect_put_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(err_msg("remote unavailable")));
        mock.expect_put_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let packs = Arc::new(PackStore::new(Box::new(mock), "blocks-bucket"));
        let packer = Packer::new(dbase.clone(), packs)
            .with_interval(Duration::from_secs(300))
            .with_pack_size(100, 200, 10);
        packer.start()?;
        dbase.put_block("block-1", &[0x11; 60])?;
        dbase.put_block("block-2", &[0x22; 60])?;
        // the first cycle fails to upload; the batch stays in packing with
        // its data intact
        packer.trigger_wait()?;
        let block = dbase.get_block("block-1")?;
        assert_eq!(block.pack_status, PackStatus::PACKING);
        assert!(block.data.is_some());
        // the next cycle retries the same batch and succeeds
        packer.trigger_wait()?;
        assert_eq!(dbase.get_block("block-1")?.pack_status, PackStatus::PACKED);
        assert_eq!(dbase.get_block("block-2")?.pack_status, PackStatus::PACKED);
        packer.stop()?;
        Ok(())
    }
}
