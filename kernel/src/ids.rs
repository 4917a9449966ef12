// Row Identity Assignment
//
// Rows sharing a fingerprint (flattened prompt text) share a short
// human-readable id; each repeat gets the next version, starting at 1.
// This is a convenience grouping key, not a content hash: unrelated
// prompts may collide only if their fingerprints are identical.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::log::{LogEntry, LogRow};

/// Source of fresh identifiers.
pub trait IdGenerator: Send {
    fn generate(&mut self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "bold", "brave", "brisk", "calm", "clever", "crimson", "curious", "dapper",
    "eager", "early", "fancy", "fierce", "gentle", "giant", "golden", "happy", "hidden", "humble",
    "icy", "jolly", "keen", "kind", "lively", "lucky", "mellow", "misty", "modest", "narrow",
    "nimble", "noble", "odd", "olive", "patient", "plain", "polite", "proud", "quick", "quiet",
    "rapid", "rusty", "silent", "silver", "sleepy", "small", "snowy", "solid", "sunny", "swift",
    "tall", "tender", "tidy", "tiny", "topaz", "vast", "velvet", "vivid", "warm", "wild",
    "wise", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "beacon", "birch", "bison", "canyon", "cedar", "comet", "coral", "crane",
    "delta", "dune", "eagle", "ember", "falcon", "fern", "fjord", "forest", "gecko", "glacier",
    "harbor", "hazel", "heron", "island", "jaguar", "jasper", "kestrel", "lagoon", "lantern", "lark",
    "lynx", "maple", "meadow", "meteor", "moose", "nebula", "oasis", "orca", "otter", "owl",
    "panda", "pebble", "pine", "prairie", "quartz", "raven", "reef", "river", "robin", "sparrow",
    "spruce", "summit", "thicket", "tiger", "tundra", "valley", "violet", "walrus", "willow", "wolf",
    "wren", "yak", "zebra", "zephyr",
];

/// Two words from a fixed vocabulary, e.g. `brave-otter`.
pub struct WordPairGenerator {
    rng: StdRng,
}

impl WordPairGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for WordPairGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for WordPairGenerator {
    fn generate(&mut self) -> String {
        let adjective = ADJECTIVES.choose(&mut self.rng).copied().unwrap_or("plain");
        let noun = NOUNS.choose(&mut self.rng).copied().unwrap_or("row");
        format!("{adjective}-{noun}")
    }
}

/// Deterministic generator: hands out the given ids in order, then
/// `id1`, `id2`, ...
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    queued: VecDeque<String>,
    counter: usize,
}

impl SequenceGenerator {
    pub fn new<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            queued: ids.into_iter().map(Into::into).collect(),
            counter: 0,
        }
    }
}

impl IdGenerator for SequenceGenerator {
    fn generate(&mut self) -> String {
        if let Some(id) = self.queued.pop_front() {
            return id;
        }
        self.counter += 1;
        format!("id{}", self.counter)
    }
}

/// Fresh draws before falling back to a suffixed id.
const MAX_DRAWS: usize = 16;

struct Slot {
    id: String,
    next_version: u32,
}

/// Assign ids and versions to `batch`, continuing from the rows already
/// cached for the active partition.
///
/// Distinct fingerprints always receive distinct ids within one cache:
/// a generated id already bound to another fingerprint is redrawn.
pub fn assign_ids(
    existing: &[LogRow],
    batch: Vec<LogEntry>,
    generator: &mut dyn IdGenerator,
) -> Vec<LogRow> {
    let mut slots: HashMap<String, Slot> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();

    for row in existing.iter().filter(|r| !r.id.is_empty()) {
        let slot = slots.entry(row.prompt_flattened.clone()).or_insert_with(|| Slot {
            id: row.id.clone(),
            next_version: 1,
        });
        slot.next_version = slot.next_version.max(row.version.saturating_add(1));
        taken.insert(row.id.clone());
    }

    batch
        .into_iter()
        .map(|entry| {
            let slot = slots
                .entry(entry.fingerprint().to_string())
                .or_insert_with(|| {
                    let id = fresh_id(generator, &taken);
                    taken.insert(id.clone());
                    Slot { id, next_version: 1 }
                });
            let version = slot.next_version;
            slot.next_version += 1;
            LogRow::from_entry(entry, slot.id.clone(), version)
        })
        .collect()
}

fn fresh_id(generator: &mut dyn IdGenerator, taken: &HashSet<String>) -> String {
    let mut last = String::new();
    for _ in 0..MAX_DRAWS {
        let candidate = generator.generate();
        if !taken.contains(&candidate) {
            return candidate;
        }
        last = candidate;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{last}{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
