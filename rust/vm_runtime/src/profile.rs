//! Execution profiler for the specializer.
//!
//! Counts how often each instruction word is fetched and keeps a tree of the
//! word sequences seen over a sliding window.  The tree answers "after this
//! path, which word usually comes next?", which is what a specializer needs
//! to decide what to compile ahead of time.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::bytecode::Word;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PathNode {
    count: u64,
    successors: HashMap<Word, PathNode>,
}

impl PathNode {
    fn walk(&self, path: &[Word]) -> Option<&PathNode> {
        path.iter()
            .try_fold(self, |node, word| node.successors.get(word))
    }
}

/// A fetched word and how often it was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: Word,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profiler {
    path_depth: usize,
    counts: HashMap<Word, u64>,
    history: VecDeque<Word>,
    root: PathNode,
}

impl Profiler {
    /// Track paths of up to `path_depth` words (at least one).
    pub fn new(path_depth: usize) -> Self {
        let path_depth = path_depth.max(1);
        Self {
            path_depth,
            counts: HashMap::new(),
            history: VecDeque::with_capacity(path_depth),
            root: PathNode::default(),
        }
    }

    pub fn path_depth(&self) -> usize {
        self.path_depth
    }

    /// Record a fetch of `word`, returning how often it has now been seen.
    pub fn record(&mut self, word: Word) -> u64 {
        if self.history.len() == self.path_depth {
            self.history.pop_front();
        }
        self.history.push_back(word);

        // Every suffix of the window ends in `word`.
        for start in 0..self.history.len() {
            let mut node = &mut self.root;
            for &step in self.history.range(start..) {
                node = node.successors.entry(step).or_default();
            }
            node.count += 1;
        }

        let count = self.counts.entry(word).or_default();
        *count += 1;
        *count
    }

    pub fn count(&self, word: Word) -> u64 {
        self.counts.get(&word).copied().unwrap_or(0)
    }

    /// How often `path` was seen as a consecutive sequence of fetches.
    pub fn path_count(&self, path: &[Word]) -> u64 {
        if path.is_empty() || path.len() > self.path_depth {
            return 0;
        }
        self.root.walk(path).map_or(0, |node| node.count)
    }

    /// The most frequent successor of `path`; ties go to the smaller word.
    pub fn predict(&self, path: &[Word]) -> Option<Word> {
        if path.len() >= self.path_depth {
            return None;
        }
        self.root
            .walk(path)?
            .successors
            .iter()
            .max_by(|(a_word, a), (b_word, b)| a.count.cmp(&b.count).then(b_word.cmp(a_word)))
            .map(|(word, _)| *word)
    }

    /// Words fetched at least `min_count` times, most frequent first.
    pub fn hot_words(&self, min_count: u64) -> Vec<WordCount> {
        let mut hot: Vec<WordCount> = self
            .counts
            .iter()
            .filter(|(_, &count)| count >= min_count)
            .map(|(&word, &count)| WordCount { word, count })
            .collect();
        hot.sort_by(|a, b| b.count.cmp(&a.count).then(a.word.cmp(&b.word)));
        hot
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.history.clear();
        self.root = PathNode::default();
    }
}
