//! Fixed-capacity operand stack.
//!
//! Slots are addressed by depth from the top: depth `0` is the most recently
//! pushed word.  Over- and underflow are checked rather than wrapped, and the
//! checks are exposed separately from the mutations so that an instruction can
//! validate its whole stack effect before it touches anything.

use thiserror::Error;

use crate::bytecode::Word;

/// Default operand stack capacity in words.
pub const DEFAULT_STACK_WORDS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    slots: Vec<Word>,
    depth: usize,
}

impl Stack {
    pub fn new(words: usize) -> Self {
        Self {
            slots: vec![0; words],
            depth: 0,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.slots.len() - self.depth
    }

    /// Valid words, bottom first.
    pub fn as_slice(&self) -> &[Word] {
        &self.slots[..self.depth]
    }

    /// Set the depth directly; the new depth must not exceed the capacity.
    pub fn set_depth(&mut self, depth: usize) -> Result<(), StackError> {
        if depth > self.slots.len() {
            return Err(StackError::Overflow {
                shortfall: (depth - self.slots.len()) as u64,
            });
        }
        self.depth = depth;
        Ok(())
    }

    /// Grow the capacity to `words`, keeping the current contents.
    pub fn grow(&mut self, words: usize) {
        if words > self.slots.len() {
            self.slots.resize(words, 0);
        }
    }

    /// Require that the slot at `depth` holds a value.
    #[inline]
    pub fn check_read(&self, depth: u64) -> Result<(), StackError> {
        if depth < self.depth as u64 {
            Ok(())
        } else {
            Err(StackError::InvalidRead { depth })
        }
    }

    /// Require room for `words` more values.
    #[inline]
    pub fn check_room(&self, words: u64) -> Result<(), StackError> {
        let free = self.free() as u64;
        if words <= free {
            Ok(())
        } else {
            Err(StackError::Overflow {
                shortfall: words - free,
            })
        }
    }

    /// Validate an effect that reads `args` words and leaves `results` words.
    pub fn check_effect(&self, args: u64, results: u64) -> Result<(), StackError> {
        if args > 0 {
            self.check_read(args - 1)?;
        }
        if results > args {
            self.check_room(results - args)?;
        }
        Ok(())
    }

    pub fn load(&self, depth: u64) -> Result<Word, StackError> {
        self.check_read(depth)?;
        Ok(self.slots[self.depth - 1 - depth as usize])
    }

    pub fn store(&mut self, depth: u64, value: Word) -> Result<(), StackError> {
        if depth >= self.depth as u64 {
            return Err(StackError::InvalidWrite { depth });
        }
        let index = self.depth - 1 - depth as usize;
        self.slots[index] = value;
        Ok(())
    }

    /// Move the top of stack by `delta` words.  Callers validate the change
    /// with [`Stack::check_effect`] first; this only guards the invariant.
    pub fn adjust(&mut self, delta: i64) -> Result<(), StackError> {
        let depth = self.depth as i64 + delta;
        if depth < 0 {
            return Err(StackError::InvalidRead {
                depth: (-delta - 1) as u64,
            });
        }
        self.set_depth(depth as usize)
    }

    pub fn push(&mut self, value: Word) -> Result<(), StackError> {
        self.check_room(1)?;
        self.slots[self.depth] = value;
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Word, StackError> {
        let value = self.load(0)?;
        self.depth -= 1;
        Ok(value)
    }
}

/// Stack discipline violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("stack overflow: {shortfall} more word(s) needed")]
    Overflow { shortfall: u64 },
    #[error("invalid stack read at depth {depth}")]
    InvalidRead { depth: u64 },
    #[error("invalid stack write at depth {depth}")]
    InvalidWrite { depth: u64 },
}

impl StackError {
    /// Value reported through the `bad` register.
    pub fn bad(&self) -> u64 {
        match self {
            StackError::Overflow { shortfall } => *shortfall,
            StackError::InvalidRead { depth } | StackError::InvalidWrite { depth } => *depth,
        }
    }
}
