use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use squircle_core::{
    assign_context, feedback_level, interleaved_plan, permutation_blocks, placement_error,
    polar_to_cartesian, Catalog, Context, PlannedTrial, TargetObject, TaskError, UsageCounters,
};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use tracing::info;

const REPLACE_TELEPORT_MIN_RADIUS: f64 = 10.0;
const COLLECT_TELEPORT_MIN_RADIUS: f64 = 12.0;
const ROTATION_STEP_DEGREES: f64 = 0.5;
const ROTATION_STEPS: u32 = (360.0 / ROTATION_STEP_DEGREES) as u32;
const ROTATION_STEP_SECONDS: f64 = 1.0 / 720.0;
const INSTRUCTION_JITTER_MAX_SECONDS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Free,
    Train,
    Test,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Free => "free",
            SessionMode::Train => "train",
            SessionMode::Test => "test",
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            SessionMode::Free => "FREE",
            SessionMode::Train => "TRAIN",
            SessionMode::Test => "TEST",
        }
    }

    pub fn has_collect_phase(self) -> bool {
        self == SessionMode::Train
    }

    pub fn has_feedback(self) -> bool {
        self != SessionMode::Free
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBindings {
    pub start_run: char,
    pub confirm: char,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub data_dir: PathBuf,
    pub arena_radius: f64,
    pub iti_seconds: f64,
    pub runs: u32,
    pub trials_per_object: usize,
    pub initial_collect_per_object: usize,
    pub warmup_runs: u32,
    pub trials_per_context: usize,
    pub run_length_seconds: f64,
    pub sample_interval_seconds: f64,
    pub keys: KeyBindings,
    pub catalog: Catalog,
}

impl SessionConfig {
    pub fn defaults_for(mode: SessionMode) -> SessionConfig {
        let keys = match mode {
            SessionMode::Free => KeyBindings {
                start_run: 't',
                confirm: 'b',
            },
            SessionMode::Train => KeyBindings {
                start_run: 't',
                confirm: 'p',
            },
            SessionMode::Test => KeyBindings {
                start_run: 's',
                confirm: 'a',
            },
        };
        let data_dir = match mode {
            SessionMode::Free => "Data/FreeData",
            SessionMode::Train => "Data/TrainingData",
            SessionMode::Test => "Data/TestingData",
        };
        SessionConfig {
            data_dir: PathBuf::from(data_dir),
            arena_radius: 14.5,
            iti_seconds: 2.0,
            runs: match mode {
                SessionMode::Free => 2,
                SessionMode::Train => 6,
                SessionMode::Test => 1,
            },
            trials_per_object: 4,
            initial_collect_per_object: 2,
            warmup_runs: 2,
            trials_per_context: 20,
            run_length_seconds: 8.075 * 60.0,
            sample_interval_seconds: 0.05,
            keys,
            catalog: Catalog::standard(),
        }
    }

    pub fn load(mode: SessionMode, path: Option<&Path>) -> Result<SessionConfig> {
        let mut config = SessionConfig::defaults_for(mode);
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("cannot read session config {}: {}", path.display(), e))?;
            let overlay: ConfigOverlay = serde_yaml::from_str(&raw)
                .map_err(|e| anyhow!("invalid session config {}: {}", path.display(), e))?;
            overlay.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        self.catalog.validate()?;
        if self.iti_seconds < 1.0 {
            return Err(TaskError::Configuration(
                "iti_seconds must be at least 1".to_string(),
            ));
        }
        if self.arena_radius <= COLLECT_TELEPORT_MIN_RADIUS {
            return Err(TaskError::Configuration(format!(
                "arena_radius must exceed {}",
                COLLECT_TELEPORT_MIN_RADIUS
            )));
        }
        if self.runs == 0 {
            return Err(TaskError::Configuration(
                "runs must be a positive integer".to_string(),
            ));
        }
        if self.trials_per_object == 0 || self.trials_per_context == 0 {
            return Err(TaskError::Configuration(
                "trial counts must be positive".to_string(),
            ));
        }
        if self.run_length_seconds <= 0.0 {
            return Err(TaskError::Configuration(
                "run_length_seconds must be positive".to_string(),
            ));
        }
        if self.sample_interval_seconds <= 0.0 {
            return Err(TaskError::Configuration(
                "sample_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    data_dir: Option<PathBuf>,
    arena_radius: Option<f64>,
    iti_seconds: Option<f64>,
    runs: Option<u32>,
    trials_per_object: Option<usize>,
    initial_collect_per_object: Option<usize>,
    warmup_runs: Option<u32>,
    trials_per_context: Option<usize>,
    run_length_seconds: Option<f64>,
    sample_interval_seconds: Option<f64>,
    keys: Option<KeyBindings>,
    catalog: Option<Catalog>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut SessionConfig) {
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.arena_radius {
            config.arena_radius = v;
        }
        if let Some(v) = self.iti_seconds {
            config.iti_seconds = v;
        }
        if let Some(v) = self.runs {
            config.runs = v;
        }
        if let Some(v) = self.trials_per_object {
            config.trials_per_object = v;
        }
        if let Some(v) = self.initial_collect_per_object {
            config.initial_collect_per_object = v;
        }
        if let Some(v) = self.warmup_runs {
            config.warmup_runs = v;
        }
        if let Some(v) = self.trials_per_context {
            config.trials_per_context = v;
        }
        if let Some(v) = self.run_length_seconds {
            config.run_length_seconds = v;
        }
        if let Some(v) = self.sample_interval_seconds {
            config.sample_interval_seconds = v;
        }
        if let Some(v) = self.keys {
            config.keys = v;
        }
        if let Some(v) = self.catalog {
            config.catalog = v;
        }
    }
}

pub fn tracking_file_name(
    mode: SessionMode,
    subject: u32,
    context: Option<Context>,
    run: u32,
) -> String {
    match context {
        Some(context) => format!(
            "{}_tracking_{}_{}_{}.txt",
            mode.file_prefix(),
            subject,
            context.number(),
            run
        ),
        None => format!("{}_tracking_{}_{}.txt", mode.file_prefix(), subject, run),
    }
}

pub type SensorId = u32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    Arena(Context),
    Message,
}

// Surface of the VR collaborator. Assets are addressed through the host by
// context, never by handle; the host keeps the context-to-asset lookup.
pub trait VrHost {
    fn pose(&self) -> Pose;
    fn teleport(&mut self, x: f64, y: f64, heading: f64);
    fn set_scene(&mut self, scene: Scene);
    fn show_message(&mut self, text: &str);
    fn clear_message(&mut self);
    fn show_feedback(&mut self, level: u8);
    fn clear_feedback(&mut self);
    fn place_object(&mut self, object: &TargetObject, location: [f64; 3]) -> SensorId;
    fn remove_object(&mut self, sensor: SensorId);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Await {
    Key(char),
    Duration(f64),
    Proximity(SensorId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    Key(char),
    Elapsed,
    ProximityEntered(SensorId),
}

fn satisfies(waiting: Await, event: SessionEvent) -> bool {
    match (waiting, event) {
        (Await::Key(expected), SessionEvent::Key(pressed)) => {
            expected.eq_ignore_ascii_case(&pressed)
        }
        (Await::Duration(_), SessionEvent::Elapsed) => true,
        (Await::Proximity(sensor), SessionEvent::ProximityEntered(entered)) => sensor == entered,
        _ => false,
    }
}

#[derive(Debug)]
pub enum Step {
    Suspended(Await),
    Complete(SessionSummary),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub mode: SessionMode,
    pub subject: u32,
    pub runs_completed: u32,
    pub trials_completed: usize,
    pub scored_trials: usize,
    pub mean_replace_error: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub log_paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct SessionLogger {
    file: File,
    path: PathBuf,
}

impl SessionLogger {
    // Exclusive create: an existing file means a prior session's data and is
    // fatal before any trial logic runs. The data directory must pre-exist.
    pub fn create(path: &Path) -> Result<SessionLogger, TaskError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(SessionLogger {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(TaskError::FileConflict(path.to_path_buf()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(TaskError::Configuration(format!(
                "data directory does not exist for {}",
                path.display()
            ))),
            Err(e) => Err(TaskError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn marker(&mut self, text: &str) -> Result<(), TaskError> {
        writeln!(self.file, "{}", text)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn sample(&mut self, elapsed: f64, x: f64, y: f64, heading: f64) -> Result<(), TaskError> {
        writeln!(
            self.file,
            "{:.3}\t{:.3}\t{:.3}\t{:.3}",
            elapsed, x, y, heading
        )?;
        self.file.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    StartReplace { context: Option<Context> },
    StartCollect,
    Replaced {
        context: Option<Context>,
        object: String,
        error: f64,
    },
    ReplacedAmbiguous {
        object: String,
        chosen: u8,
        circle_error: f64,
        square_error: f64,
    },
    Collected { object: String, initial: bool },
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim();
    if line == "Start collect" {
        return Some(Marker::StartCollect);
    }
    if let Some(rest) = line.strip_prefix("Start replace") {
        if rest.is_empty() {
            return Some(Marker::StartReplace { context: None });
        }
        let context = Context::from_name(rest.strip_prefix(", ")?)?;
        return Some(Marker::StartReplace {
            context: Some(context),
        });
    }
    if let Some(rest) = line.strip_prefix("Replaced ") {
        let fields: Vec<&str> = rest.split(", ").collect();
        return match fields.as_slice() {
            [context, object, chosen, first, second]
                if Context::from_name(context) == Some(Context::Squircle) =>
            {
                Some(Marker::ReplacedAmbiguous {
                    object: object.to_string(),
                    chosen: chosen.parse().ok()?,
                    circle_error: first.parse().ok()?,
                    square_error: second.parse().ok()?,
                })
            }
            [context, object, error] => Some(Marker::Replaced {
                context: Some(Context::from_name(context)?),
                object: object.to_string(),
                error: error.parse().ok()?,
            }),
            [object, error] => Some(Marker::Replaced {
                context: None,
                object: object.to_string(),
                error: error.parse().ok()?,
            }),
            _ => None,
        };
    }
    if let Some(object) = line.strip_prefix("Collected ") {
        return Some(Marker::Collected {
            object: object.to_string(),
            initial: false,
        });
    }
    if let Some(object) = line.strip_suffix(" Collected Initial") {
        return Some(Marker::Collected {
            object: object.to_string(),
            initial: true,
        });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbiguousScore {
    pub chosen: u8,
    pub circle_error: f64,
    pub square_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceOutcome {
    pub context: Context,
    pub object: String,
    pub error: f64,
    pub ambiguous: Option<AmbiguousScore>,
}

// Squircle trials score against both candidate locations; the smaller error
// names the interpretation the participant appears to have used.
pub fn score_replacement(object: &TargetObject, context: Context, stop: [f64; 3]) -> ReplaceOutcome {
    if context == Context::Squircle {
        let [circle_location, square_location] = object.candidate_locations();
        let circle_error = placement_error(circle_location, stop);
        let square_error = placement_error(square_location, stop);
        let chosen = if circle_error < square_error { 1 } else { 2 };
        ReplaceOutcome {
            context,
            object: object.name.clone(),
            error: circle_error.min(square_error),
            ambiguous: Some(AmbiguousScore {
                chosen,
                circle_error,
                square_error,
            }),
        }
    } else {
        ReplaceOutcome {
            context,
            object: object.name.clone(),
            error: placement_error(object.location_in(context), stop),
            ambiguous: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScoreKeeper {
    errors: Vec<f64>,
}

impl ScoreKeeper {
    pub fn record(&mut self, error: f64) {
        self.errors.push(error);
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    pub fn mean_error(&self) -> Option<f64> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.iter().sum::<f64>() / self.errors.len() as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ActiveKind {
    WarmupCollect,
    Collect,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    RunIntro,
    IntroSettle,
    Instruction(ActiveKind),
    InstructionJitter,
    FeedbackDwell,
    Collect { sensor: SensorId, warmup: bool },
    Rotate { step: u32, x: f64, y: f64, heading: f64 },
    Replace,
    FreeExplore,
    RunOutro,
    ClosingGoodJob,
    ClosingMessage,
    TestClosing,
    Done,
}

#[derive(Debug)]
pub struct Session {
    mode: SessionMode,
    subject: u32,
    config: SessionConfig,
    run_number: u32,
    runs_total: u32,
    context: Context,
    test_plan: Vec<PlannedTrial>,
    test_index: usize,
    warmup_queue: VecDeque<usize>,
    trial_queue: VecDeque<usize>,
    current_object: usize,
    phase: Phase,
    pending: Await,
    logger: Option<SessionLogger>,
    scores: ScoreKeeper,
    rng: StdRng,
    clock_origin: f64,
    started_at: DateTime<Utc>,
    trials_completed: usize,
    runs_completed: u32,
    log_paths: Vec<PathBuf>,
}

impl Session {
    pub fn new(
        mode: SessionMode,
        subject: u32,
        run: Option<u32>,
        config: SessionConfig,
        seed: Option<u64>,
    ) -> Result<Session> {
        config.validate()?;
        if subject == 0 {
            return Err(TaskError::Configuration(
                "subject id must be a positive integer".to_string(),
            )
            .into());
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut session = Session {
            mode,
            subject,
            run_number: 1,
            runs_total: config.runs,
            context: Context::Circle,
            test_plan: Vec::new(),
            test_index: 0,
            warmup_queue: VecDeque::new(),
            trial_queue: VecDeque::new(),
            current_object: 0,
            phase: Phase::Idle,
            pending: Await::Duration(0.0),
            logger: None,
            scores: ScoreKeeper::default(),
            rng,
            clock_origin: 0.0,
            started_at: Utc::now(),
            trials_completed: 0,
            runs_completed: 0,
            log_paths: Vec::new(),
            config,
        };
        if mode == SessionMode::Test {
            let run = run.ok_or_else(|| {
                TaskError::Configuration("test mode requires a run number".to_string())
            })?;
            if run == 0 {
                return Err(TaskError::Configuration(
                    "run number must be a positive integer".to_string(),
                )
                .into());
            }
            session.run_number = run;
            let path = session
                .config
                .data_dir
                .join(tracking_file_name(mode, subject, None, run));
            let logger = SessionLogger::create(&path)?;
            session.log_paths.push(logger.path().to_path_buf());
            session.logger = Some(logger);
            let mut counters = UsageCounters::new(session.config.catalog.len());
            session.test_plan = interleaved_plan(
                session.config.catalog.len(),
                session.config.trials_per_context,
                &mut counters,
                &mut session.rng,
            )?;
        }
        Ok(session)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn test_plan(&self) -> &[PlannedTrial] {
        &self.test_plan
    }

    pub fn begin(&mut self, host: &mut dyn VrHost, now: f64) -> Result<Step> {
        if self.phase != Phase::Idle {
            return Err(anyhow!("session already started"));
        }
        self.started_at = Utc::now();
        self.clock_origin = now;
        match self.mode {
            SessionMode::Test => {
                host.set_scene(Scene::Message);
                host.show_message(&format!("Run {}, waiting for T", self.run_number));
                self.phase = Phase::RunIntro;
                Ok(self.suspend(Await::Key(self.config.keys.start_run)))
            }
            SessionMode::Free | SessionMode::Train => self.start_run(host),
        }
    }

    // Resolves the pending wait. Events that do not match it (stray keys,
    // foreign sensors) leave the session untouched.
    pub fn resume(&mut self, host: &mut dyn VrHost, event: SessionEvent, now: f64) -> Result<Step> {
        if self.phase == Phase::Idle {
            return Err(anyhow!("session not started: call begin first"));
        }
        if self.phase == Phase::Done {
            return Err(anyhow!("session already complete"));
        }
        if !satisfies(self.pending, event) {
            return Ok(Step::Suspended(self.pending));
        }
        match self.phase {
            Phase::Idle | Phase::Done => unreachable!("handled above"),
            Phase::RunIntro => {
                host.clear_message();
                match self.mode {
                    SessionMode::Test => {
                        self.clock_origin = now;
                        self.start_test_trial(host)
                    }
                    SessionMode::Free | SessionMode::Train => {
                        self.phase = Phase::IntroSettle;
                        Ok(self.suspend(Await::Duration(self.config.iti_seconds - 1.0)))
                    }
                }
            }
            Phase::IntroSettle => match self.mode {
                SessionMode::Free => {
                    host.set_scene(Scene::Arena(self.context));
                    let (x, y, heading) = self.random_entry_pose(REPLACE_TELEPORT_MIN_RADIUS);
                    host.teleport(x, y, heading);
                    self.phase = Phase::FreeExplore;
                    Ok(self.suspend(Await::Key(self.config.keys.confirm)))
                }
                _ => self.next_train_step(host),
            },
            Phase::Instruction(kind) => match (kind, self.mode) {
                (ActiveKind::Replace, SessionMode::Test) => {
                    let jitter = self.rng.gen_range(0..INSTRUCTION_JITTER_MAX_SECONDS);
                    self.phase = Phase::InstructionJitter;
                    Ok(self.suspend(Await::Duration(jitter as f64)))
                }
                (ActiveKind::Replace, _) => {
                    host.clear_message();
                    self.log_marker("Start replace")?;
                    host.set_scene(Scene::Arena(self.context));
                    let (x, y, heading) = self.random_entry_pose(REPLACE_TELEPORT_MIN_RADIUS);
                    host.teleport(x, y, heading);
                    self.phase = Phase::Replace;
                    Ok(self.suspend(Await::Key(self.config.keys.confirm)))
                }
                (warmup_or_collect, _) => {
                    host.clear_message();
                    self.log_marker("Start collect")?;
                    host.set_scene(Scene::Arena(self.context));
                    let (x, y, heading) = self.random_entry_pose(COLLECT_TELEPORT_MIN_RADIUS);
                    host.teleport(x, y, heading);
                    let object = &self.config.catalog.objects[self.current_object];
                    let location = object.location_in(self.context);
                    let sensor = host.place_object(object, location);
                    self.phase = Phase::Collect {
                        sensor,
                        warmup: warmup_or_collect == ActiveKind::WarmupCollect,
                    };
                    Ok(self.suspend(Await::Proximity(sensor)))
                }
            },
            Phase::InstructionJitter => {
                host.clear_message();
                let trial = self.test_plan[self.test_index];
                let text = format!("Start replace, {}", trial.context);
                self.log_marker(&text)?;
                host.set_scene(Scene::Arena(trial.context));
                let (x, y, heading) = self.random_entry_pose(REPLACE_TELEPORT_MIN_RADIUS);
                host.teleport(x, y, heading);
                self.phase = Phase::Rotate {
                    step: 1,
                    x,
                    y,
                    heading,
                };
                Ok(self.suspend(Await::Duration(ROTATION_STEP_SECONDS)))
            }
            Phase::Rotate { step, x, y, heading } => {
                if step < ROTATION_STEPS {
                    let turned = (heading + step as f64 * ROTATION_STEP_DEGREES) % 360.0;
                    host.teleport(x, y, turned);
                    self.phase = Phase::Rotate {
                        step: step + 1,
                        x,
                        y,
                        heading,
                    };
                    Ok(self.suspend(Await::Duration(ROTATION_STEP_SECONDS)))
                } else {
                    self.phase = Phase::Replace;
                    Ok(self.suspend(Await::Key(self.config.keys.confirm)))
                }
            }
            Phase::Replace => match self.mode {
                SessionMode::Test => self.finish_test_replace(host, now),
                _ => self.finish_train_replace(host),
            },
            Phase::FeedbackDwell => {
                host.clear_feedback();
                let name = self.config.catalog.objects[self.current_object].name.clone();
                host.show_message(&format!("Collect {}", name));
                self.phase = Phase::Instruction(ActiveKind::Collect);
                Ok(self.suspend(Await::Duration(self.config.iti_seconds + 1.0)))
            }
            Phase::Collect { sensor, warmup } => {
                host.remove_object(sensor);
                let name = self.config.catalog.objects[self.current_object].name.clone();
                if warmup {
                    self.log_marker(&format!("{} Collected Initial", name))?;
                } else {
                    self.log_marker(&format!("Collected {}", name))?;
                }
                self.trials_completed += 1;
                self.next_train_step(host)
            }
            Phase::FreeExplore => {
                self.runs_completed += 1;
                if self.run_number < self.runs_total {
                    self.run_number += 1;
                    self.start_run(host)
                } else {
                    self.begin_closing(host)
                }
            }
            Phase::RunOutro => {
                host.clear_message();
                self.runs_completed += 1;
                info!(
                    run = self.run_number,
                    mean_replace_error = self.scores.mean_error(),
                    "run complete"
                );
                if self.run_number < self.runs_total {
                    self.run_number += 1;
                    self.start_run(host)
                } else {
                    self.begin_closing(host)
                }
            }
            Phase::ClosingGoodJob => {
                host.clear_message();
                host.show_message(self.closing_text());
                self.phase = Phase::ClosingMessage;
                Ok(self.suspend(Await::Duration(self.config.iti_seconds)))
            }
            Phase::ClosingMessage => {
                host.clear_message();
                self.complete()
            }
            Phase::TestClosing => {
                host.clear_feedback();
                self.complete()
            }
        }
    }

    // Periodic tracking sample, driven by the host loop at a fixed cadence
    // independent of the phase logic.
    pub fn log_sample(&mut self, host: &dyn VrHost, now: f64) -> Result<(), TaskError> {
        if let Some(logger) = self.logger.as_mut() {
            let pose = host.pose();
            logger.sample(now - self.clock_origin, pose.x, pose.y, pose.heading)?;
        }
        Ok(())
    }

    fn suspend(&mut self, waiting: Await) -> Step {
        self.pending = waiting;
        Step::Suspended(waiting)
    }

    fn log_marker(&mut self, text: &str) -> Result<(), TaskError> {
        if let Some(logger) = self.logger.as_mut() {
            logger.marker(text)?;
        }
        Ok(())
    }

    fn random_entry_pose(&mut self, min_radius: f64) -> (f64, f64, f64) {
        let radius = self.rng.gen_range(min_radius..self.config.arena_radius);
        let angle = self.rng.gen_range(0.0..360.0);
        let (x, y) = polar_to_cartesian(radius, angle);
        let heading = self.rng.gen_range(0.0..360.0);
        (x, y, heading)
    }

    fn start_run(&mut self, host: &mut dyn VrHost) -> Result<Step> {
        self.context = assign_context(self.run_number, self.subject);
        if self.mode == SessionMode::Train {
            let path = self.config.data_dir.join(tracking_file_name(
                self.mode,
                self.subject,
                Some(self.context),
                self.run_number,
            ));
            let logger = SessionLogger::create(&path)?;
            self.log_paths.push(logger.path().to_path_buf());
            self.logger = Some(logger);
            let catalog_len = self.config.catalog.len();
            self.warmup_queue = if self.run_number <= self.config.warmup_runs {
                permutation_blocks(
                    catalog_len,
                    self.config.initial_collect_per_object,
                    &mut self.rng,
                )?
                .into()
            } else {
                VecDeque::new()
            };
            self.trial_queue =
                permutation_blocks(catalog_len, self.config.trials_per_object, &mut self.rng)?
                    .into();
        }
        info!(
            run = self.run_number,
            context = %self.context,
            "run started"
        );
        host.set_scene(Scene::Message);
        let activity = match self.mode {
            SessionMode::Free => "exploration of",
            _ => "training in",
        };
        host.show_message(&format!(
            "Press {} to start {} Arena {}",
            self.config.keys.start_run,
            activity,
            self.context.number()
        ));
        self.phase = Phase::RunIntro;
        Ok(self.suspend(Await::Key(self.config.keys.start_run)))
    }

    fn next_train_step(&mut self, host: &mut dyn VrHost) -> Result<Step> {
        if let Some(object) = self.warmup_queue.pop_front() {
            self.current_object = object;
            let name = self.config.catalog.objects[object].name.clone();
            host.set_scene(Scene::Message);
            host.show_message(&format!("Collect {}", name));
            self.phase = Phase::Instruction(ActiveKind::WarmupCollect);
            Ok(self.suspend(Await::Duration(self.config.iti_seconds + 1.0)))
        } else if let Some(object) = self.trial_queue.pop_front() {
            self.current_object = object;
            let name = self.config.catalog.objects[object].name.clone();
            host.set_scene(Scene::Message);
            host.show_message(&format!("Replace {}", name));
            self.phase = Phase::Instruction(ActiveKind::Replace);
            Ok(self.suspend(Await::Duration(self.config.iti_seconds + 1.0)))
        } else {
            host.set_scene(Scene::Message);
            host.show_message("Good job!");
            self.phase = Phase::RunOutro;
            Ok(self.suspend(Await::Duration(self.config.iti_seconds)))
        }
    }

    fn start_test_trial(&mut self, host: &mut dyn VrHost) -> Result<Step> {
        let trial = self.test_plan[self.test_index];
        let name = self.config.catalog.objects[trial.object].name.clone();
        host.set_scene(Scene::Message);
        host.show_message(&format!("Replace {}", name));
        self.phase = Phase::Instruction(ActiveKind::Replace);
        Ok(self.suspend(Await::Duration(self.config.iti_seconds)))
    }

    fn finish_train_replace(&mut self, host: &mut dyn VrHost) -> Result<Step> {
        let pose = host.pose();
        let object = &self.config.catalog.objects[self.current_object];
        let outcome = score_replacement(object, self.context, [pose.x, 0.0, pose.y]);
        let text = format!("Replaced {}, {:.3}", outcome.object, outcome.error);
        self.log_marker(&text)?;
        self.scores.record(outcome.error);
        let level = feedback_level(outcome.error);
        host.set_scene(Scene::Message);
        host.show_feedback(level);
        self.phase = Phase::FeedbackDwell;
        Ok(self.suspend(Await::Duration(self.config.iti_seconds - 1.0)))
    }

    fn finish_test_replace(&mut self, host: &mut dyn VrHost, now: f64) -> Result<Step> {
        let pose = host.pose();
        let trial = self.test_plan[self.test_index];
        let object = &self.config.catalog.objects[trial.object];
        let outcome = score_replacement(object, trial.context, [pose.x, 0.0, pose.y]);
        let text = match outcome.ambiguous {
            Some(score) => format!(
                "Replaced {}, {}, {}, {:.3}, {:.3}",
                trial.context, outcome.object, score.chosen, score.circle_error, score.square_error
            ),
            None => {
                self.scores.record(outcome.error);
                format!(
                    "Replaced {}, {}, {:.3}",
                    trial.context, outcome.object, outcome.error
                )
            }
        };
        self.log_marker(&text)?;
        self.trials_completed += 1;
        self.test_index += 1;
        let out_of_time = now - self.clock_origin >= self.config.run_length_seconds;
        if out_of_time || self.test_index >= self.test_plan.len() {
            self.runs_completed += 1;
            info!(
                run = self.run_number,
                trials = self.trials_completed,
                mean_replace_error = self.scores.mean_error(),
                "run complete"
            );
            host.set_scene(Scene::Message);
            if let Some(mean) = self.scores.mean_error() {
                host.show_feedback(feedback_level(mean));
            }
            self.phase = Phase::TestClosing;
            Ok(self.suspend(Await::Duration(self.config.iti_seconds + 2.0)))
        } else {
            self.start_test_trial(host)
        }
    }

    fn begin_closing(&mut self, host: &mut dyn VrHost) -> Result<Step> {
        host.set_scene(Scene::Message);
        host.show_message("Good job!");
        self.phase = Phase::ClosingGoodJob;
        Ok(self.suspend(Await::Duration(self.config.iti_seconds)))
    }

    fn closing_text(&self) -> &'static str {
        match self.mode {
            SessionMode::Free => "Free Exploration Complete. Please get experimenter",
            _ => "Training Complete. Please get experimenter",
        }
    }

    fn complete(&mut self) -> Result<Step> {
        self.phase = Phase::Done;
        self.logger = None;
        info!(
            trials = self.trials_completed,
            mean_replace_error = self.scores.mean_error(),
            "session complete"
        );
        Ok(Step::Complete(SessionSummary {
            mode: self.mode,
            subject: self.subject,
            runs_completed: self.runs_completed,
            trials_completed: self.trials_completed,
            scored_trials: self.scores.count(),
            mean_replace_error: self.scores.mean_error(),
            started_at: self.started_at,
            log_paths: self.log_paths.clone(),
        }))
    }
}

// Stand-in for the VR collaborator: tracks the pose it is told about and
// answers proximity walks by stepping onto the placed object.
pub struct SimulatedHost {
    pose: Pose,
    rng: StdRng,
    placed: Vec<(SensorId, [f64; 3])>,
    next_sensor: SensorId,
    scene: Option<Scene>,
    message: Option<String>,
    feedback: Option<u8>,
}

impl SimulatedHost {
    pub fn new(seed: u64) -> SimulatedHost {
        SimulatedHost {
            pose: Pose {
                x: 0.0,
                y: 0.0,
                heading: 0.0,
            },
            rng: StdRng::seed_from_u64(seed),
            placed: Vec::new(),
            next_sensor: 1,
            scene: None,
            message: None,
            feedback: None,
        }
    }

    pub fn scene(&self) -> Option<Scene> {
        self.scene
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn feedback(&self) -> Option<u8> {
        self.feedback
    }

    fn think_seconds(&mut self) -> f64 {
        self.rng.gen_range(0.5..4.0)
    }

    fn wander(&mut self) {
        let radius = self.rng.gen_range(0.0..10.0);
        let angle = self.rng.gen_range(0.0..360.0);
        let (x, y) = polar_to_cartesian(radius, angle);
        self.pose = Pose {
            x,
            y,
            heading: self.rng.gen_range(0.0..360.0),
        };
    }

    fn walk_to(&mut self, sensor: SensorId) -> f64 {
        if let Some((_, location)) = self.placed.iter().find(|(id, _)| *id == sensor) {
            self.pose = Pose {
                x: location[0],
                y: location[2],
                heading: self.pose.heading,
            };
        }
        self.rng.gen_range(2.0..8.0)
    }
}

impl VrHost for SimulatedHost {
    fn pose(&self) -> Pose {
        self.pose
    }

    fn teleport(&mut self, x: f64, y: f64, heading: f64) {
        self.pose = Pose { x, y, heading };
    }

    fn set_scene(&mut self, scene: Scene) {
        self.scene = Some(scene);
    }

    fn show_message(&mut self, text: &str) {
        self.message = Some(text.to_string());
    }

    fn clear_message(&mut self) {
        self.message = None;
    }

    fn show_feedback(&mut self, level: u8) {
        self.feedback = Some(level);
    }

    fn clear_feedback(&mut self) {
        self.feedback = None;
    }

    fn place_object(&mut self, _object: &TargetObject, location: [f64; 3]) -> SensorId {
        let sensor = self.next_sensor;
        self.next_sensor += 1;
        self.placed.push((sensor, location));
        sensor
    }

    fn remove_object(&mut self, sensor: SensorId) {
        self.placed.retain(|(id, _)| *id != sensor);
    }
}

// Drives a whole session headlessly against the simulated participant,
// producing real tracking files. Used for protocol smoke-runs.
pub fn run_simulated(
    mode: SessionMode,
    subject: u32,
    run: Option<u32>,
    config: SessionConfig,
    seed: Option<u64>,
) -> Result<SessionSummary> {
    let sample_interval = config.sample_interval_seconds;
    let mut session = Session::new(mode, subject, run, config, seed)?;
    let mut host = SimulatedHost::new(seed.unwrap_or(0).wrapping_add(0x5eed));
    let mut clock = 0.0f64;
    let mut next_sample = sample_interval;
    let mut step = session.begin(&mut host, clock)?;
    let mut iterations: usize = 0;
    loop {
        let waiting = match step {
            Step::Complete(summary) => return Ok(summary),
            Step::Suspended(waiting) => waiting,
        };
        iterations += 1;
        if iterations > 5_000_000 {
            return Err(anyhow!("simulated session failed to terminate"));
        }
        let event = match waiting {
            Await::Duration(seconds) => {
                clock += seconds.max(0.0);
                SessionEvent::Elapsed
            }
            Await::Key(key) => {
                clock += host.think_seconds();
                host.wander();
                SessionEvent::Key(key)
            }
            Await::Proximity(sensor) => {
                clock += host.walk_to(sensor);
                SessionEvent::ProximityEntered(sensor)
            }
        };
        while next_sample <= clock {
            session.log_sample(&host, next_sample)?;
            next_sample += sample_interval;
        }
        step = session.resume(&mut host, event, clock)?;
    }
}
