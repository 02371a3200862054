//! Static stack-effect descriptions.
//!
//! Every instruction with a knowable effect carries a [`StackEffect`]: a
//! picture of the arguments it reads and of the results it leaves, written
//! bottom to top as in `"x ITEMS y COUNT"`.  The special item `ITEMS` stands
//! for `COUNT` words that the instruction steps over without naming, which
//! makes the picture's size symbolic (`base + COUNT`).  Pictures are checked
//! once, when the instruction table is built, so the dispatch loop can trust
//! the depths it computes.

use thiserror::Error;

/// Name of the variadic placeholder.
pub const ITEMS: &str = "ITEMS";
/// Name of the argument that sizes `ITEMS`.
pub const COUNT: &str = "COUNT";
/// Upper bound on named items in one picture.
pub const MAX_ITEMS: usize = 4;

/// A depth or size that may include the runtime `COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Depth {
    pub words: u64,
    pub counted: bool,
}

impl Depth {
    pub const fn fixed(words: u64) -> Self {
        Self {
            words,
            counted: false,
        }
    }

    /// Concrete value for a given `COUNT`.
    #[inline]
    pub fn resolve(self, count: u64) -> u64 {
        if self.counted {
            self.words.saturating_add(count)
        } else {
            self.words
        }
    }
}

/// One named operand or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackItem {
    pub name: &'static str,
    /// Width in words; `ITEMS` has width `COUNT` and records 0 here.
    pub width: u64,
    /// Distance from the top of the picture.
    pub depth: Depth,
}

impl StackItem {
    pub fn is_variadic(&self) -> bool {
        self.name == ITEMS
    }
}

/// Ordered top-of-stack layout, bottom first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPicture {
    items: Vec<StackItem>,
    size: Depth,
}

impl StackPicture {
    /// Parse a whitespace separated picture such as `"x ITEMS y COUNT"`.
    pub fn parse(picture: &'static str) -> Result<Self, EffectError> {
        Self::parse_with(picture, false)
    }

    /// Results may name the same value twice (`DUP` leaves two copies of `x`).
    fn parse_with(picture: &'static str, allow_repeats: bool) -> Result<Self, EffectError> {
        let names: Vec<&'static str> = picture.split_whitespace().collect();
        let mut items = Vec::with_capacity(names.len());
        let mut depth = Depth::default();
        for &name in names.iter().rev() {
            let repeated = items.iter().any(|item: &StackItem| item.name == name);
            if repeated && (!allow_repeats || name == ITEMS) {
                return Err(EffectError::DuplicateName(name));
            }
            let variadic = name == ITEMS;
            items.push(StackItem {
                name,
                width: if variadic { 0 } else { 1 },
                depth,
            });
            if variadic {
                depth.counted = true;
            } else {
                depth.words += 1;
            }
        }
        items.reverse();
        let picture = Self { items, size: depth };
        if picture.named().count() > MAX_ITEMS {
            return Err(EffectError::TooManyItems(picture.named().count()));
        }
        Ok(picture)
    }

    pub fn items(&self) -> &[StackItem] {
        &self.items
    }

    /// Items that are loaded or stored individually (everything but `ITEMS`).
    pub fn named(&self) -> impl Iterator<Item = &StackItem> + '_ {
        self.items.iter().filter(|item| !item.is_variadic())
    }

    pub fn size(&self) -> Depth {
        self.size
    }

    pub fn is_variadic(&self) -> bool {
        self.size.counted
    }

    pub fn get(&self, name: &str) -> Option<&StackItem> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Number of items beneath `ITEMS`, if present.
    fn items_position(&self) -> Option<usize> {
        self.items.iter().position(StackItem::is_variadic)
    }
}

/// Arguments and results of one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEffect {
    args: StackPicture,
    results: StackPicture,
    count_depth: Option<u64>,
    in_place: Vec<bool>,
}

impl StackEffect {
    pub fn new(args: &'static str, results: &'static str) -> Result<Self, EffectError> {
        let args = StackPicture::parse(args)?;
        let results = StackPicture::parse_with(results, true)?;

        let count_depth = match (args.items_position(), args.get(COUNT)) {
            (None, _) => None,
            (Some(_), None) => return Err(EffectError::ItemsWithoutCount),
            (Some(_), Some(count)) if count.depth.counted => {
                return Err(EffectError::ItemsWithoutCount)
            }
            (Some(_), Some(count)) => Some(count.depth.words),
        };
        match (args.items_position(), results.items_position()) {
            (None, Some(_)) => return Err(EffectError::ItemsInResultsOnly),
            (Some(before), Some(after)) if before != after => {
                return Err(EffectError::ItemsMoved { before, after })
            }
            _ => {}
        }

        let in_place = results
            .named()
            .map(|result| match args.get(result.name) {
                Some(arg) => same_slot(&args, arg, &results, result),
                None => false,
            })
            .collect();

        Ok(Self {
            args,
            results,
            count_depth,
            in_place,
        })
    }

    pub fn args(&self) -> &StackPicture {
        &self.args
    }

    pub fn results(&self) -> &StackPicture {
        &self.results
    }

    /// Depth of `COUNT` among the arguments, for variadic effects.
    pub fn count_depth(&self) -> Option<u64> {
        self.count_depth
    }

    pub fn is_variadic(&self) -> bool {
        self.count_depth.is_some()
    }

    /// Concrete `(argument words, result words)` for a given `COUNT`.
    pub fn sizes(&self, count: u64) -> (u64, u64) {
        (self.args.size.resolve(count), self.results.size.resolve(count))
    }

    /// Named results paired with whether they already sit in their final
    /// slot (same name, same position as an argument).
    pub fn named_results(&self) -> impl Iterator<Item = (&StackItem, bool)> + '_ {
        self.results.named().zip(self.in_place.iter().copied())
    }
}

fn same_slot(
    args: &StackPicture,
    arg: &StackItem,
    results: &StackPicture,
    result: &StackItem,
) -> bool {
    // Position from the bottom is size minus depth; compare the fixed and
    // counted parts separately.
    let words = |picture: &StackPicture, item: &StackItem| {
        picture.size.words as i64 - item.depth.words as i64
    };
    let counted = |picture: &StackPicture, item: &StackItem| {
        picture.size.counted as i64 - item.depth.counted as i64
    };
    words(args, arg) == words(results, result) && counted(args, arg) == counted(results, result)
}

/// Malformed effect pictures, reported when the instruction table is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("item '{0}' appears twice in one picture")]
    DuplicateName(&'static str),
    #[error("ITEMS needs a COUNT argument above it")]
    ItemsWithoutCount,
    #[error("ITEMS appears in the results but not in the arguments")]
    ItemsInResultsOnly,
    #[error("ITEMS moves from position {before} to {after}")]
    ItemsMoved { before: usize, after: usize },
    #[error("{0} named items exceed the operand buffer")]
    TooManyItems(usize),
}
