//! Test data generation for benchmarks.
//!
//! Generators are seeded so runs are reproducible.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardline_core::{row, FieldDef, FieldType, Model, Registry, Row, Segment, Value};

/// Scale factor for benchmark data generation.
#[derive(Clone, Copy, Debug, Default)]
pub enum Scale {
    /// 10 rows, for quick iteration.
    Tiny,
    /// 100 rows.
    Small,
    /// 2,000 rows.
    #[default]
    Medium,
}

impl Scale {
    /// Rows generated at this scale.
    pub fn count(&self) -> usize {
        match self {
            Scale::Tiny => 10,
            Scale::Small => 100,
            Scale::Medium => 2_000,
        }
    }
}

/// Registry with an `activity` segment keyed by id and a `chat` segment
/// keyed by room name.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            Segment::new("app", "activity").with_model(
                Model::new("Activity")
                    .with_field(FieldDef::new("kind", FieldType::String))
                    .with_field(FieldDef::new("payload", FieldType::String)),
            ),
        )
        .expect("activity segment");
    registry
        .register(
            Segment::new("app", "chat").with_model(
                Model::new("Message")
                    .with_field(FieldDef::new("room", FieldType::String))
                    .with_key_field("room"),
            ),
        )
        .expect("chat segment");
    registry
}

/// Activity rows with ids `1..=count`.
pub fn generate_activities(count: usize) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(42);
    (1..=count as i64)
        .map(|id| {
            let payload: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(64)
                .map(char::from)
                .collect();
            row! {
                "id" => id,
                "kind" => ["login", "view", "logout"][rng.gen_range(0..3)],
                "payload" => payload,
            }
        })
        .collect()
}

/// Mixed integer and string routing keys.
pub fn generate_keys(count: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|i| {
            if i % 2 == 0 {
                Value::Int(rng.gen_range(0..1_000_000))
            } else {
                Value::String(format!("room-{}", rng.gen::<u32>()))
            }
        })
        .collect()
}
