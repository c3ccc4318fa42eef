//! LOCATE, SPACE and position reporting

use super::{Direction, Locate, LocateOutcome, PositionInfo, SpaceCode, SpaceOutcome, TapePartition};
use crate::error::{Condition, Error, Result};
use crate::tape::blk_map::SpaceStop;
use crate::tape::entry::EntryKind;
use crate::tape::lookup::LookupEntry;

/// Units a whole map contributes when it can be skipped without loading
fn skippable(code: SpaceCode, entry: &LookupEntry, lids: u64, todo: u64) -> Option<u64> {
    match code {
        SpaceCode::Blocks if entry.fids == 0 && entry.sids == 0 && lids <= todo => Some(lids),
        SpaceCode::Filemarks if entry.sids == 0 && (entry.fids as u64) < todo => Some(entry.fids as u64),
        SpaceCode::Setmarks if (entry.sids as u64) < todo => Some(entry.sids as u64),
        _ => None,
    }
}

fn mark_condition(kind: EntryKind) -> Condition {
    match kind {
        EntryKind::Setmark => Condition::Setmark,
        _ => Condition::Filemark,
    }
}

impl TapePartition {
    /// Flush buffered writes and queued reads before repositioning
    async fn pre_space(&mut self) -> Result<()> {
        if self.direction == Direction::Write {
            self.flush_writes().await?;
        }
        self.flush_reads().await
    }

    fn post_space(&mut self) {
        self.trim_window();
        self.segments_synced = false;
    }

    /// Rewind to the beginning of the partition
    pub async fn position_bop(&mut self) -> Result<()> {
        self.pre_space().await?;
        match self.chain.first_ref() {
            Some(first) => self.reset_window(first).await?,
            None => self.maps.clear(),
        }
        self.cur = 0;
        self.post_space();
        Ok(())
    }

    async fn goto_eod(&mut self) -> Result<()> {
        if let Some(last) = self.chain.locate_entry(&self.segs, u64::MAX).await? {
            self.reset_window(last).await?;
            self.cur_map_mut()?.cursor = None;
        }
        Ok(())
    }

    pub async fn locate(&mut self, target: Locate) -> Result<LocateOutcome> {
        self.pre_space().await?;
        let mut outcome = LocateOutcome::default();
        match target {
            Locate::Block(lid) => match self.chain.locate_entry(&self.segs, lid).await? {
                Some(r) => {
                    self.reset_window(r).await?;
                    let map = self.cur_map_mut()?;
                    map.locate(lid);
                    if map.current_lid() != lid {
                        outcome.condition = Some(Condition::EndOfData);
                    }
                }
                None if lid > 0 => outcome.condition = Some(Condition::EndOfData),
                None => {}
            },
            Locate::File(fid) => match self.chain.locate_file_entry(&self.segs, fid).await? {
                Some((r, _)) => {
                    self.reset_window(r).await?;
                    if !self.cur_map_mut()?.locate_file(fid) {
                        return Err(Error::Format(format!(
                            "block map disagrees with lookup index on filemark {}",
                            fid
                        )));
                    }
                }
                None => {
                    self.goto_eod().await?;
                    outcome.condition = Some(Condition::EndOfData);
                }
            },
            Locate::Eod => self.goto_eod().await?,
        }
        self.post_space();
        log::debug!(
            "TapePartition::locate: partition {} {:?} -> {} ({:?})",
            self.id(),
            target,
            self.current_lid(),
            outcome.condition
        );
        Ok(outcome)
    }

    /// Space `count` units forward (positive) or backward (negative)
    pub async fn space(&mut self, code: SpaceCode, count: i64) -> Result<SpaceOutcome> {
        self.pre_space().await?;
        let mut outcome = SpaceOutcome::default();
        if code == SpaceCode::EndOfData {
            self.goto_eod().await?;
        } else if count != 0 {
            let mut todo = count.unsigned_abs();
            if self.maps.is_empty() {
                outcome.condition = Some(if count > 0 {
                    Condition::EndOfData
                } else {
                    Condition::BeginningOfMedia
                });
            } else if count > 0 {
                outcome.condition = self.space_forward(code, &mut todo).await?;
            } else {
                outcome.condition = self.space_backward(code, &mut todo).await?;
            }
            outcome.residual = todo;
        }
        self.post_space();
        log::debug!(
            "TapePartition::space: partition {} {:?} {} -> {} residual {} ({:?})",
            self.id(),
            code,
            count,
            self.current_lid(),
            outcome.residual,
            outcome.condition
        );
        Ok(outcome)
    }

    async fn space_forward(&mut self, code: SpaceCode, todo: &mut u64) -> Result<Option<Condition>> {
        loop {
            let map = self.cur_map_mut()?;
            map.ensure_loaded().await?;
            match map.space_forward(code, todo) {
                SpaceStop::Done => return Ok(None),
                SpaceStop::Mark(kind) => return Ok(Some(mark_condition(kind))),
                SpaceStop::Boundary => {}
            }

            let mut r = map.mref;
            loop {
                let Some(next) = self.chain.next_ref(&self.segs, r).await? else {
                    // the window map is the last one; its end is EOD
                    return Ok(Some(Condition::EndOfData));
                };
                let entry = self.chain.entry(next)?;
                let lids = self.chain.map_lids(&self.segs, next).await?;
                match lids.and_then(|lids| skippable(code, &entry, lids, *todo)) {
                    Some(units) => {
                        *todo -= units;
                        r = next;
                    }
                    None => {
                        self.reset_window(next).await?;
                        break;
                    }
                }
            }
        }
    }

    async fn space_backward(&mut self, code: SpaceCode, todo: &mut u64) -> Result<Option<Condition>> {
        loop {
            let map = self.cur_map_mut()?;
            map.ensure_loaded().await?;
            match map.space_backward(code, todo) {
                SpaceStop::Done => return Ok(None),
                SpaceStop::Mark(kind) => return Ok(Some(mark_condition(kind))),
                SpaceStop::Boundary => {}
            }

            let window = map.mref;
            let mut r = window;
            loop {
                let Some(prev) = self.chain.prev_ref(&self.segs, r).await? else {
                    if r != window {
                        self.reset_window(r).await?;
                    }
                    return Ok(Some(Condition::BeginningOfMedia));
                };
                let entry = self.chain.entry(prev)?;
                let lids = self.chain.entry(r)?.lid - entry.lid;
                match skippable(code, &entry, lids, *todo) {
                    Some(units) => {
                        *todo -= units;
                        r = prev;
                    }
                    None => {
                        self.reset_window(prev).await?;
                        self.cur_map_mut()?.cursor = None;
                        break;
                    }
                }
            }
        }
    }

    /// Position, totals in front of it and buffered write state
    pub fn read_position(&self) -> PositionInfo {
        let (file, set) = self.cur_map().map(|m| m.current_ids()).unwrap_or((0, 0));
        let block = self.current_lid();
        PositionInfo {
            bop: block == 0,
            eop: self.used_bytes() + self.config.early_warning_size >= self.size(),
            block,
            file,
            set,
            buffered_blocks: self.pending_blocks,
            buffered_bytes: self.pending_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BlockPtr;

    fn entry(fids: u8, sids: u8) -> LookupEntry {
        LookupEntry {
            lid: 0,
            fids,
            sids,
            location: BlockPtr::new(1, 1),
        }
    }

    #[test]
    fn test_whole_map_skip_rules() {
        assert_eq!(skippable(SpaceCode::Blocks, &entry(0, 0), 10, 10), Some(10));
        assert_eq!(skippable(SpaceCode::Blocks, &entry(0, 0), 11, 10), None);
        assert_eq!(skippable(SpaceCode::Blocks, &entry(1, 0), 1, 10), None);
        // a map holding exactly the remaining filemarks must be entered
        assert_eq!(skippable(SpaceCode::Filemarks, &entry(3, 0), 50, 3), None);
        assert_eq!(skippable(SpaceCode::Filemarks, &entry(2, 0), 50, 3), Some(2));
        assert_eq!(skippable(SpaceCode::Filemarks, &entry(0, 1), 50, 3), None);
        assert_eq!(skippable(SpaceCode::Setmarks, &entry(9, 1), 50, 3), Some(1));
        assert_eq!(skippable(SpaceCode::EndOfData, &entry(0, 0), 1, 3), None);
    }
}
