//! ARIES-style write-ahead log: record write path, per-transaction
//! rollback, and three-pass (analysis/redo/undo) recovery.
//!
//! Grounded almost line-for-line on `log_manager.cc`, including its
//! deliberate simplification of redoing only committed transactions
//! (rather than redo-all-then-undo-losers), which is safe here because
//! abort always applies before-images before the page can be evicted.
//! One correction: the source's `write_log_record` never actually
//! serializes a `CHECKPOINT` record's active-txn list (a bug; its
//! `get_record_size` agrees only because it also omits that field). This
//! port adds the missing `count: u64` + pairs framing, since recovery
//! cannot be correct without it.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};

use crate::buffer_pool::BufferManager;
use crate::error::Result;
use crate::file::BlockFile;
use crate::io::{Decodeable, Encodeable};
use crate::page::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    Begin = 1,
    Update = 2,
    Commit = 3,
    Abort = 4,
    Checkpoint = 5,
}

impl RecordType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RecordType::Begin,
            2 => RecordType::Update,
            3 => RecordType::Commit,
            4 => RecordType::Abort,
            5 => RecordType::Checkpoint,
            other => panic!("unknown log record type tag {}", other),
        }
    }
}

struct LogRecord {
    record_type: RecordType,
    txn_id: u64,
    page_id: u64,
    length: u64,
    offset: u64,
    before_img: Vec<u8>,
    after_img: Vec<u8>,
    active_txns: Vec<(u64, u64)>,
}

impl LogRecord {
    fn header(record_type: RecordType, txn_id: u64) -> Self {
        LogRecord {
            record_type,
            txn_id,
            page_id: 0,
            length: 0,
            offset: 0,
            before_img: Vec::new(),
            after_img: Vec::new(),
            active_txns: Vec::new(),
        }
    }

    fn serialized_size(&self) -> u64 {
        let mut size = 1 + 8; // type tag + txn_id
        match self.record_type {
            RecordType::Update => {
                size += 8 + 8 + 8; // page_id + length + offset
                size += self.length * 2;
            }
            RecordType::Checkpoint => {
                size += 8 + self.active_txns.len() as u64 * 16;
            }
            _ => {}
        }
        size
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.record_type as u8];
        buf.extend(self.txn_id.encode());
        match self.record_type {
            RecordType::Update => {
                buf.extend(self.page_id.encode());
                buf.extend(self.length.encode());
                buf.extend(self.offset.encode());
                buf.extend_from_slice(&self.before_img);
                buf.extend_from_slice(&self.after_img);
            }
            RecordType::Checkpoint => {
                buf.extend((self.active_txns.len() as u64).encode());
                for (txn_id, first_offset) in &self.active_txns {
                    buf.extend(txn_id.encode());
                    buf.extend(first_offset.encode());
                }
            }
            _ => {}
        }
        buf
    }
}

/// Writes log records to a `BlockFile` and drives recovery against a
/// `BufferManager`.
pub struct LogManager {
    log_file: Box<dyn BlockFile>,
    current_offset: u64,
    txn_id_to_first_log_record: HashMap<u64, u64>,
    log_record_type_to_count: BTreeMap<RecordType, u64>,
    active_txns: HashSet<u64>,
}

impl LogManager {
    pub fn new(log_file: Box<dyn BlockFile>) -> Self {
        let mut counts = BTreeMap::new();
        for t in [
            RecordType::Begin,
            RecordType::Update,
            RecordType::Commit,
            RecordType::Abort,
            RecordType::Checkpoint,
        ] {
            counts.insert(t, 0);
        }
        LogManager {
            log_file,
            current_offset: 0,
            txn_id_to_first_log_record: HashMap::new(),
            log_record_type_to_count: counts,
            active_txns: HashSet::new(),
        }
    }

    /// Replaces the backing log file in place, preserving in-memory
    /// transaction state and `current_offset`. Simulates a process crash
    /// that leaves the log manager object alive with a freshly reopened
    /// file handle; a true cold start uses `LogManager::new`.
    pub fn reset(&mut self, log_file: Box<dyn BlockFile>) {
        self.log_file = log_file;
    }

    pub fn get_total_log_records(&self) -> u64 {
        self.log_record_type_to_count.values().sum()
    }

    pub fn get_total_log_records_of_type(&self, record_type: RecordType) -> u64 {
        *self.log_record_type_to_count.get(&record_type).unwrap_or(&0)
    }

    fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let bytes = record.encode();
        let size = record.serialized_size();
        debug_assert_eq!(bytes.len() as u64, size);
        if self.log_file.size() < self.current_offset + size {
            self.log_file.resize(self.current_offset + size)?;
        }
        self.log_file.write_block(&bytes, self.current_offset, bytes.len())?;
        self.current_offset += size;
        *self.log_record_type_to_count.entry(record.record_type).or_insert(0) += 1;
        Ok(())
    }

    fn read_record(&mut self, offset: u64) -> Result<LogRecord> {
        let mut tag = [0u8; 1];
        self.log_file.read_block(offset, 1, &mut tag)?;
        let record_type = RecordType::from_u8(tag[0]);

        let mut cursor = offset + 1;
        let txn_id = self.read_u64(cursor)?;
        cursor += 8;

        let mut record = LogRecord::header(record_type, txn_id);

        match record_type {
            RecordType::Update => {
                record.page_id = self.read_u64(cursor)?;
                cursor += 8;
                record.length = self.read_u64(cursor)?;
                cursor += 8;
                record.offset = self.read_u64(cursor)?;
                cursor += 8;
                let mut before = vec![0u8; record.length as usize];
                self.log_file.read_block(cursor, record.length as usize, &mut before)?;
                cursor += record.length;
                let mut after = vec![0u8; record.length as usize];
                self.log_file.read_block(cursor, record.length as usize, &mut after)?;
                record.before_img = before;
                record.after_img = after;
            }
            RecordType::Checkpoint => {
                let count = self.read_u64(cursor)?;
                cursor += 8;
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let txn = self.read_u64(cursor)?;
                    cursor += 8;
                    let first_offset = self.read_u64(cursor)?;
                    cursor += 8;
                    pairs.push((txn, first_offset));
                }
                record.active_txns = pairs;
            }
            _ => {}
        }

        Ok(record)
    }

    fn read_u64(&mut self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.log_file.read_block(offset, 8, &mut buf)?;
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        Ok(u64::decode_from(&mut cursor).unwrap())
    }

    pub fn log_txn_begin(&mut self, txn_id: u64) -> Result<()> {
        self.txn_id_to_first_log_record.insert(txn_id, self.current_offset);
        self.active_txns.insert(txn_id);
        let record = LogRecord::header(RecordType::Begin, txn_id);
        self.write_record(&record)
    }

    pub fn log_update(
        &mut self,
        txn_id: u64,
        page_id: u64,
        length: u64,
        offset: u64,
        before_img: &[u8],
        after_img: &[u8],
    ) -> Result<()> {
        let mut record = LogRecord::header(RecordType::Update, txn_id);
        record.page_id = page_id;
        record.length = length;
        record.offset = offset;
        record.before_img = before_img.to_vec();
        record.after_img = after_img.to_vec();
        self.write_record(&record)
    }

    pub fn log_commit(&mut self, txn_id: u64) -> Result<()> {
        let record = LogRecord::header(RecordType::Commit, txn_id);
        self.write_record(&record)?;
        self.active_txns.remove(&txn_id);
        Ok(())
    }

    pub fn log_abort(&mut self, txn_id: u64, buffer_manager: &BufferManager) -> Result<()> {
        self.rollback_txn(txn_id, buffer_manager)?;
        let record = LogRecord::header(RecordType::Abort, txn_id);
        self.write_record(&record)?;
        self.active_txns.remove(&txn_id);
        Ok(())
    }

    pub fn log_checkpoint(&mut self, buffer_manager: &BufferManager) -> Result<()> {
        buffer_manager.flush_all_pages()?;
        let mut record = LogRecord::header(RecordType::Checkpoint, 0);
        record.active_txns = self
            .active_txns
            .iter()
            .map(|&txn_id| (txn_id, *self.txn_id_to_first_log_record.get(&txn_id).unwrap_or(&0)))
            .collect();
        self.write_record(&record)
    }

    /// Scans from `first_log_record[txn]` to `current_offset`, collects
    /// this transaction's updates, and applies their before-images in
    /// reverse encounter order.
    pub fn rollback_txn(&mut self, txn_id: u64, buffer_manager: &BufferManager) -> Result<()> {
        let start = *self.txn_id_to_first_log_record.get(&txn_id).unwrap_or(&0);
        let mut updates = Vec::new();
        let mut offset = start;
        while offset < self.current_offset {
            let record = self.read_record(offset)?;
            let size = record.serialized_size();
            if record.record_type == RecordType::Update && record.txn_id == txn_id {
                updates.push(record);
            }
            offset += size;
        }

        for record in updates.into_iter().rev() {
            let page_id = PageId::from_raw(record.page_id);
            let frame_id = buffer_manager.fix_page(crate::page::INVALID_TXN_ID, page_id, true)?;
            let mut data = buffer_manager.read_page_data(frame_id);
            let start = record.offset as usize;
            data[start..start + record.length as usize].copy_from_slice(&record.before_img);
            buffer_manager.write_page_data(frame_id, &data);
            buffer_manager.unfix_page(frame_id, true);
        }

        buffer_manager.flush_all_pages()
    }

    /// Analysis / redo / undo recovery, per the source's documented
    /// redo-committed-only simplification.
    pub fn recovery(&mut self, buffer_manager: &BufferManager) -> Result<()> {
        info!("recovery: starting analysis pass");
        let mut active: HashSet<u64> = HashSet::new();
        let mut committed: HashSet<u64> = HashSet::new();
        let mut last_checkpoint_txns: HashMap<u64, u64> = HashMap::new();
        let mut last_checkpoint_offset = 0u64;

        let mut offset = 0u64;
        while offset < self.current_offset {
            let record = self.read_record(offset)?;
            let size = record.serialized_size();
            match record.record_type {
                RecordType::Begin => {
                    if !committed.contains(&record.txn_id) {
                        active.insert(record.txn_id);
                        self.txn_id_to_first_log_record.insert(record.txn_id, offset);
                    }
                }
                RecordType::Commit => {
                    active.remove(&record.txn_id);
                    committed.insert(record.txn_id);
                }
                RecordType::Abort => {
                    active.remove(&record.txn_id);
                }
                RecordType::Checkpoint => {
                    last_checkpoint_offset = offset;
                    last_checkpoint_txns = record.active_txns.into_iter().collect();
                }
                RecordType::Update => {}
            }
            offset += size;
        }

        if last_checkpoint_offset > 0 || !last_checkpoint_txns.is_empty() {
            for (txn_id, first_offset) in &last_checkpoint_txns {
                if !committed.contains(txn_id) {
                    active.insert(*txn_id);
                    self.txn_id_to_first_log_record.insert(*txn_id, *first_offset);
                }
            }
        }

        info!("recovery: redo pass, {} committed txns", committed.len());
        let mut offset = 0u64;
        while offset < self.current_offset {
            let record = self.read_record(offset)?;
            let size = record.serialized_size();
            if record.record_type == RecordType::Update && committed.contains(&record.txn_id) {
                let page_id = PageId::from_raw(record.page_id);
                let frame_id = buffer_manager.fix_page(crate::page::INVALID_TXN_ID, page_id, true)?;
                let mut data = buffer_manager.read_page_data(frame_id);
                let start = record.offset as usize;
                data[start..start + record.length as usize].copy_from_slice(&record.after_img);
                buffer_manager.write_page_data(frame_id, &data);
                buffer_manager.unfix_page(frame_id, true);
            }
            offset += size;
        }

        info!("recovery: undo pass, {} active txns", active.len());
        for txn_id in active.iter().copied().collect::<Vec<_>>() {
            self.rollback_txn(txn_id, buffer_manager)?;
        }

        self.active_txns = active;
        buffer_manager.flush_all_pages()?;
        debug!("recovery complete");
        Ok(())
    }
}
