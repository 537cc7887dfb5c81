use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const FEEDBACK_THRESHOLDS: [f64; 4] = [3.0, 5.0, 7.0, 9.0];

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("configuration_error: {0}")]
    Configuration(String),
    #[error("tracking_file_exists: {}", .0.display())]
    FileConflict(PathBuf),
    #[error("log write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    Circle,
    Square,
    Squircle,
}

impl Context {
    pub fn name(self) -> &'static str {
        match self {
            Context::Circle => "circle",
            Context::Square => "square",
            Context::Squircle => "squircle",
        }
    }

    // Arena numbering used in file names and operator messages.
    pub fn number(self) -> u8 {
        match self {
            Context::Circle => 1,
            Context::Square => 2,
            Context::Squircle => 3,
        }
    }

    pub fn from_name(name: &str) -> Option<Context> {
        match name {
            "circle" => Some(Context::Circle),
            "square" => Some(Context::Square),
            "squircle" => Some(Context::Squircle),
            _ => None,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn polar_to_cartesian(radius: f64, angle_degrees: f64) -> (f64, f64) {
    let phi = angle_degrees.to_radians();
    (radius * phi.cos(), radius * phi.sin())
}

// Horizontal-plane distance; the height component of both points is ignored.
pub fn placement_error(target: [f64; 3], actual: [f64; 3]) -> f64 {
    let dx = target[0] - actual[0];
    let dz = target[2] - actual[2];
    (dx * dx + dz * dz).sqrt()
}

// Level 1..=5 against the ascending thresholds; an error exactly on a
// threshold takes the lower bucket.
pub fn feedback_level(error: f64) -> u8 {
    1 + FEEDBACK_THRESHOLDS.iter().filter(|t| error > **t).count() as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetObject {
    pub name: String,
    pub circle_location: [f64; 3],
    pub square_location: [f64; 3],
    pub scale: f64,
}

impl TargetObject {
    pub fn location_in(&self, context: Context) -> [f64; 3] {
        match context {
            Context::Square => self.square_location,
            _ => self.circle_location,
        }
    }

    // Squircle has no location table of its own; its two scoring candidates
    // are the circle-table and square-table positions.
    pub fn candidate_locations(&self) -> [[f64; 3]; 2] {
        [self.circle_location, self.square_location]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub objects: Vec<TargetObject>,
}

impl Catalog {
    pub fn standard() -> Catalog {
        let object = |name: &str, circle: [f64; 3], square: [f64; 3], scale: f64| TargetObject {
            name: name.to_string(),
            circle_location: circle,
            square_location: square,
            scale,
        };
        Catalog {
            objects: vec![
                object("cone", [-4.0, 0.07, 9.0], [4.0, 0.07, 9.0], 0.15),
                object("beachball", [2.0, 0.29, 5.0], [-2.0, 0.29, 5.0], 1.8),
                object("plant", [-7.0, 0.07, -4.0], [7.0, 0.07, -4.0], 1.25),
                object("pumpkin", [10.0, 0.05, -5.0], [-10.0, 0.05, -5.0], 1.8),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TargetObject> {
        self.objects.get(index)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.objects.is_empty() {
            return Err(TaskError::Configuration(
                "object catalog is empty".to_string(),
            ));
        }
        for object in &self.objects {
            if object.name.is_empty() {
                return Err(TaskError::Configuration(
                    "catalog object with empty name".to_string(),
                ));
            }
            if object.scale <= 0.0 {
                return Err(TaskError::Configuration(format!(
                    "catalog object '{}' has non-positive scale",
                    object.name
                )));
            }
        }
        Ok(())
    }
}

// Contexts alternate by run parity; which context the odd run gets flips by
// subject parity, so the run-to-context mapping balances across subjects.
pub fn assign_context(run_number: u32, subject_id: u32) -> Context {
    if run_number % 2 == 0 {
        if subject_id % 2 == 0 {
            Context::Circle
        } else {
            Context::Square
        }
    } else if subject_id % 2 == 0 {
        Context::Square
    } else {
        Context::Circle
    }
}

#[derive(Debug, Clone)]
pub struct UsageCounters {
    counts: BTreeMap<Context, Vec<u32>>,
}

impl UsageCounters {
    pub fn new(catalog_len: usize) -> UsageCounters {
        let mut counts = BTreeMap::new();
        for context in [Context::Circle, Context::Square, Context::Squircle] {
            counts.insert(context, vec![0; catalog_len]);
        }
        UsageCounters { counts }
    }

    pub fn counts(&self, context: Context) -> &[u32] {
        self.counts
            .get(&context)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // Picks uniformly among the least-presented objects for the context and
    // records the presentation. The returned index never carries a count
    // above the pre-pick minimum.
    pub fn pick_least_used<R: Rng>(
        &mut self,
        context: Context,
        rng: &mut R,
    ) -> Result<usize, TaskError> {
        let counts = self
            .counts
            .get_mut(&context)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TaskError::Configuration("object catalog is empty".to_string()))?;
        let min = *counts.iter().min().expect("non-empty counts");
        let minimal: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == min)
            .map(|(i, _)| i)
            .collect();
        let picked = minimal[rng.gen_range(0..minimal.len())];
        counts[picked] += 1;
        Ok(picked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedTrial {
    pub context: Context,
    pub object: usize,
}

// Concatenated random permutations of the catalog; every object appears once
// per block, so any prefix is balanced to within one presentation.
pub fn permutation_blocks<R: Rng>(
    catalog_len: usize,
    blocks: usize,
    rng: &mut R,
) -> Result<Vec<usize>, TaskError> {
    if catalog_len == 0 {
        return Err(TaskError::Configuration(
            "object catalog is empty".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(catalog_len * blocks);
    for _ in 0..blocks {
        let mut block: Vec<usize> = (0..catalog_len).collect();
        block.shuffle(rng);
        out.extend(block);
    }
    Ok(out)
}

// Trial plan for the scanner task: even blocks interleave the two
// unambiguous contexts, odd blocks add the squircle, and each emitted
// context takes its least-presented object.
pub fn interleaved_plan<R: Rng>(
    catalog_len: usize,
    blocks: usize,
    counters: &mut UsageCounters,
    rng: &mut R,
) -> Result<Vec<PlannedTrial>, TaskError> {
    if catalog_len == 0 {
        return Err(TaskError::Configuration(
            "object catalog is empty".to_string(),
        ));
    }
    let mut plan = Vec::new();
    for block in 0..blocks {
        let mut contexts = if block % 2 == 1 {
            vec![Context::Circle, Context::Square, Context::Squircle]
        } else {
            vec![Context::Circle, Context::Square]
        };
        contexts.shuffle(rng);
        for context in contexts {
            let object = counters.pick_least_used(context, rng)?;
            plan.push(PlannedTrial { context, object });
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn polar_conversion_treats_angle_as_degrees() {
        let (x, y) = polar_to_cartesian(2.0, 90.0);
        assert!(x.abs() < 1e-9, "x was {}", x);
        assert!((y - 2.0).abs() < 1e-9, "y was {}", y);
        let (x, y) = polar_to_cartesian(1.0, 180.0);
        assert!((x + 1.0).abs() < 1e-9, "x was {}", x);
        assert!(y.abs() < 1e-9, "y was {}", y);
    }

    #[test]
    fn placement_error_ignores_height() {
        let error = placement_error([0.0, 0.07, 0.0], [3.0, 12.5, 4.0]);
        assert!((error - 5.0).abs() < 1e-12);
    }

    #[test]
    fn feedback_levels_use_lower_bucket_at_exact_thresholds() {
        assert_eq!(feedback_level(2.9), 1);
        assert_eq!(feedback_level(3.0), 1);
        assert_eq!(feedback_level(3.1), 2);
        assert_eq!(feedback_level(5.0), 2);
        assert_eq!(feedback_level(5.5), 3);
        assert_eq!(feedback_level(9.0), 4);
        assert_eq!(feedback_level(9.1), 5);
        assert_eq!(feedback_level(0.0), 1);
    }

    #[test]
    fn assign_context_alternates_runs_and_flips_by_subject_parity() {
        for subject in 1..=8 {
            for run in 1..=8 {
                assert_eq!(
                    assign_context(run, subject),
                    assign_context(run, subject),
                    "deterministic"
                );
                assert_ne!(
                    assign_context(run, subject),
                    assign_context(run + 1, subject),
                    "run {} subject {} must alternate",
                    run,
                    subject
                );
            }
            assert_ne!(
                assign_context(1, subject),
                assign_context(1, subject + 1),
                "subject parity must flip the mapping"
            );
        }
    }

    #[test]
    fn pick_least_used_never_exceeds_minimum() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut counters = UsageCounters::new(4);
        for _ in 0..200 {
            let before = counters.counts(Context::Square).to_vec();
            let min = *before.iter().min().expect("counts");
            let picked = counters
                .pick_least_used(Context::Square, &mut rng)
                .expect("pick");
            assert_eq!(before[picked], min);
        }
    }

    #[test]
    fn usage_spread_stays_within_one_per_context() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counters = UsageCounters::new(4);
        interleaved_plan(4, 40, &mut counters, &mut rng).expect("plan");
        for context in [Context::Circle, Context::Square, Context::Squircle] {
            let counts = counters.counts(context);
            let max = counts.iter().max().expect("counts");
            let min = counts.iter().min().expect("counts");
            assert!(max - min <= 1, "{}: spread {:?}", context, counts);
        }
    }

    #[test]
    fn pick_least_used_rejects_empty_catalog() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut counters = UsageCounters::new(0);
        let err = counters
            .pick_least_used(Context::Circle, &mut rng)
            .expect_err("empty catalog must fail");
        assert!(matches!(err, TaskError::Configuration(_)));
    }

    #[test]
    fn permutation_blocks_balance_every_block() {
        let mut rng = StdRng::seed_from_u64(21);
        let order = permutation_blocks(4, 5, &mut rng).expect("blocks");
        assert_eq!(order.len(), 20);
        for block in order.chunks(4) {
            let mut sorted = block.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn interleaved_plan_alternates_two_and_three_way_blocks() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut counters = UsageCounters::new(4);
        let plan = interleaved_plan(4, 6, &mut counters, &mut rng).expect("plan");
        assert_eq!(plan.len(), 2 + 3 + 2 + 3 + 2 + 3);
        let mut cursor = 0;
        for block in 0..6 {
            let width = if block % 2 == 1 { 3 } else { 2 };
            let contexts: Vec<Context> =
                plan[cursor..cursor + width].iter().map(|t| t.context).collect();
            assert!(contexts.contains(&Context::Circle));
            assert!(contexts.contains(&Context::Square));
            assert_eq!(
                contexts.contains(&Context::Squircle),
                width == 3,
                "block {}",
                block
            );
            cursor += width;
        }
    }

    #[test]
    fn allocator_prefix_spread_holds_over_plan() {
        let mut rng = StdRng::seed_from_u64(97);
        let mut counters = UsageCounters::new(4);
        let plan = interleaved_plan(4, 20, &mut counters, &mut rng).expect("plan");
        let mut running = UsageCounters::new(4);
        for trial in &plan {
            let counts = running
                .counts
                .get_mut(&trial.context)
                .expect("context counts");
            counts[trial.object] += 1;
            let max = counts.iter().max().expect("counts");
            let min = counts.iter().min().expect("counts");
            assert!(max - min <= 1, "prefix spread exceeded at {:?}", trial);
        }
    }

    #[test]
    fn standard_catalog_matches_task_layout() {
        let catalog = Catalog::standard();
        catalog.validate().expect("valid");
        assert_eq!(catalog.len(), 4);
        let pumpkin = catalog.get(3).expect("pumpkin");
        assert_eq!(pumpkin.name, "pumpkin");
        assert_eq!(pumpkin.location_in(Context::Circle), [10.0, 0.05, -5.0]);
        assert_eq!(pumpkin.location_in(Context::Square), [-10.0, 0.05, -5.0]);
        assert_eq!(
            pumpkin.candidate_locations(),
            [pumpkin.circle_location, pumpkin.square_location]
        );
    }

    #[test]
    fn empty_catalog_fails_validation() {
        let catalog = Catalog { objects: vec![] };
        assert!(matches!(
            catalog.validate(),
            Err(TaskError::Configuration(_))
        ));
    }
}
