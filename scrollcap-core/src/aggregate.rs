use std::collections::HashMap;

use crate::model::{Attribution, Block, BlockKind, RawBlock, Role};

/// Identity of a block: its kind plus a bounded prefix of its text.
///
/// Sequence numbers are deliberately not part of the key, since the same
/// content is observed again in overlapping scroll frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    kind: BlockKind,
    prefix: String,
}

impl BlockKey {
    pub fn new(kind: BlockKind, text: &str, prefix_len: usize) -> Self {
        Self {
            kind,
            prefix: text.chars().take(prefix_len).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer<'a> {
    pub accepted: bool,
    pub block: &'a Block,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub accepted: usize,
    pub duplicates: usize,
}

/// Append-only, order-preserving store of captured blocks.
#[derive(Debug, Clone)]
pub struct Aggregator {
    prefix_len: usize,
    index: HashMap<BlockKey, usize>,
    blocks: Vec<Block>,
    next_sequence: u64,
}

impl Aggregator {
    pub fn new(prefix_len: usize) -> Self {
        Self {
            prefix_len,
            index: HashMap::new(),
            blocks: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Offers a single block. Frame-local parent links are ignored; use
    /// [`Aggregator::offer_frame`] to keep notes attached to their message.
    pub fn offer(&mut self, raw: &RawBlock) -> Offer<'_> {
        self.insert(raw, raw.role, None)
    }

    /// Offers every block of one extraction frame in order, resolving each
    /// note's frame-local parent to the sequence of the stored message.
    ///
    /// Positionally inferred roles are re-anchored to conversation order: a
    /// message alternates from the message before it, whether that one was
    /// stored earlier or seen again in this frame.
    pub fn offer_frame(&mut self, frame: &[RawBlock]) -> FrameOutcome {
        let mut sequences: Vec<u64> = Vec::with_capacity(frame.len());
        let mut outcome = FrameOutcome::default();
        let mut previous_role = self.last_message_role();

        for raw in frame {
            let (role, linked) = match raw.kind {
                BlockKind::AuxiliaryNote => {
                    let linked = raw
                        .parent
                        .and_then(|parent| sequences.get(parent).copied())
                        .filter(|sequence| self.is_message(*sequence));
                    (raw.role, linked)
                }
                BlockKind::Message => match (raw.role, previous_role) {
                    (Some(Attribution::Inferred(_)), Some(previous)) => {
                        (Some(Attribution::Inferred(previous.other())), None)
                    }
                    _ => (raw.role, None),
                },
            };

            let offer = self.insert(raw, role, linked);
            if offer.block.kind == BlockKind::Message {
                previous_role = offer.block.role.map(|attribution| attribution.role());
            }
            let accepted = offer.accepted;
            sequences.push(offer.block.sequence);
            if accepted {
                outcome.accepted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        outcome
    }

    fn insert(
        &mut self,
        raw: &RawBlock,
        role: Option<Attribution>,
        linked_sequence: Option<u64>,
    ) -> Offer<'_> {
        let key = BlockKey::new(raw.kind, &raw.text, self.prefix_len);
        if let Some(&position) = self.index.get(&key) {
            return Offer {
                accepted: false,
                block: &self.blocks[position],
            };
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let position = self.blocks.len();
        self.blocks.push(Block {
            sequence,
            kind: raw.kind,
            role,
            text: raw.text.clone(),
            linked_sequence,
        });
        self.index.insert(key, position);

        Offer {
            accepted: true,
            block: &self.blocks[position],
        }
    }

    fn block_at(&self, sequence: u64) -> Option<&Block> {
        // Sequences are assigned densely from 0 in insertion order.
        self.blocks.get(usize::try_from(sequence).ok()?)
    }

    fn is_message(&self, sequence: u64) -> bool {
        self.block_at(sequence)
            .is_some_and(|block| block.kind == BlockKind::Message)
    }

    fn last_message_role(&self) -> Option<Role> {
        self.blocks
            .iter()
            .rev()
            .find(|block| block.kind == BlockKind::Message)
            .and_then(|block| block.role)
            .map(|attribution| attribution.role())
    }

    pub fn get(&self, key: &BlockKey) -> Option<&Block> {
        self.index.get(key).map(|&position| &self.blocks[position])
    }

    /// Blocks sorted by sequence, which is insertion order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}
