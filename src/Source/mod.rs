//! Event sources feeding the send pipelines.
//!
//! A source yields [`PhysicsEvent`]s in order until it is exhausted. Sources
//! are opened inside their own task, so a source that cannot be opened only
//! fails that task.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::error::SourceError;
use crate::Stream::record::{FourVector, PhysicsEvent, PHOTON_MASS, PION_MASS};

/// Spherical momentum columns, three per particle in record order.
pub const COLUMNS: [&str; 12] = [
    "mag_plus_rec",
    "theta_plus_rec",
    "phi_plus_rec",
    "mag_neg_rec",
    "theta_neg_rec",
    "phi_neg_rec",
    "mag_neutral1_rec",
    "theta_neutral1_rec",
    "phi_neutral1_rec",
    "mag_neutral2_rec",
    "theta_neutral2_rec",
    "phi_neutral2_rec",
];

const MASSES: [f64; 4] = [PION_MASS, PION_MASS, PHOTON_MASS, PHOTON_MASS];

pub trait EventSource: Send {
    /// Name used in logs and reports.
    fn label(&self) -> &str;

    /// Prepare for reading. Returns the number of events when it is known up front.
    fn open(&mut self) -> Result<Option<u64>, SourceError>;

    /// Next event in source order, `None` once exhausted.
    fn next_event(&mut self) -> Result<Option<PhysicsEvent>, SourceError>;
}

impl<T: EventSource + ?Sized> EventSource for Box<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    fn open(&mut self) -> Result<Option<u64>, SourceError> {
        (**self).open()
    }

    fn next_event(&mut self) -> Result<Option<PhysicsEvent>, SourceError> {
        (**self).next_event()
    }
}

/// Build an event from `(|p|, θ, φ)` triples in [`COLUMNS`] order.
pub fn event_from_spherical(values: &[f64; 12]) -> PhysicsEvent {
    let particle = |i: usize| {
        FourVector::from_spherical(values[3 * i], values[3 * i + 1], values[3 * i + 2], MASSES[i])
    };
    PhysicsEvent {
        pi_plus: particle(0),
        pi_minus: particle(1),
        gamma1: particle(2),
        gamma2: particle(3),
    }
}

enum TableState {
    Closed,
    Reading {
        lines: Lines<BufReader<File>>,
        line_no: usize,
        columns: [usize; 12],
        width: usize,
    },
    Finished,
}

/// Whitespace-separated text table with `[tree]` sections.
///
/// ```text
/// [h22]
/// mag_plus_rec theta_plus_rec phi_plus_rec ...
/// 1.20 0.35 1.57 ...
/// ```
pub struct TableSource {
    path: PathBuf,
    tree: String,
    label: String,
    state: TableState,
}

impl TableSource {
    pub fn new(path: impl Into<PathBuf>, tree: impl Into<String>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self {
            path,
            tree: tree.into(),
            label,
            state: TableState::Closed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn locate(&self) -> Result<TableState, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Open {
            path: self.path.clone(),
            source,
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0;
        let section = format!("[{}]", self.tree);

        let mut found = false;
        for line in lines.by_ref() {
            line_no += 1;
            if line?.trim() == section {
                found = true;
                break;
            }
        }
        if !found {
            return Err(SourceError::TreeNotFound {
                tree: self.tree.clone(),
                path: self.path.clone(),
            });
        }

        let header = loop {
            let Some(line) = lines.next() else {
                return Err(SourceError::Parse {
                    line: line_no,
                    reason: format!("tree '{}' has no header row", self.tree),
                });
            };
            line_no += 1;
            let line = line?;
            let trimmed = line.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                break line;
            }
        };

        let names: Vec<&str> = header.split_whitespace().collect();
        let mut columns = [0usize; 12];
        for (slot, wanted) in columns.iter_mut().zip(COLUMNS) {
            *slot = names
                .iter()
                .position(|name| *name == wanted)
                .ok_or_else(|| SourceError::MissingColumn {
                    tree: self.tree.clone(),
                    column: wanted,
                })?;
        }

        Ok(TableState::Reading {
            lines,
            line_no,
            columns,
            width: names.len(),
        })
    }
}

impl EventSource for TableSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<Option<u64>, SourceError> {
        if matches!(self.state, TableState::Closed) {
            self.state = self.locate()?;
        }
        Ok(None)
    }

    fn next_event(&mut self) -> Result<Option<PhysicsEvent>, SourceError> {
        if matches!(self.state, TableState::Closed) {
            self.open()?;
        }
        let TableState::Reading {
            lines,
            line_no,
            columns,
            width,
        } = &mut self.state
        else {
            return Ok(None);
        };

        loop {
            let Some(line) = lines.next() else {
                self.state = TableState::Finished;
                return Ok(None);
            };
            *line_no += 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') {
                // next tree
                self.state = TableState::Finished;
                return Ok(None);
            }

            let cells: Vec<&str> = trimmed.split_whitespace().collect();
            if cells.len() != *width {
                return Err(SourceError::Parse {
                    line: *line_no,
                    reason: format!("expected {} columns, found {}", width, cells.len()),
                });
            }
            let mut values = [0.0f64; 12];
            for (value, &col) in values.iter_mut().zip(columns.iter()) {
                *value = cells[col].parse().map_err(|_| SourceError::Parse {
                    line: *line_no,
                    reason: format!("'{}' is not a number", cells[col]),
                })?;
            }
            return Ok(Some(event_from_spherical(&values)));
        }
    }
}

/// Events held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    label: String,
    events: VecDeque<PhysicsEvent>,
    total: u64,
}

impl MemorySource {
    pub fn new(label: impl Into<String>, events: Vec<PhysicsEvent>) -> Self {
        let total = events.len() as u64;
        Self {
            label: label.into(),
            events: events.into(),
            total,
        }
    }
}

impl EventSource for MemorySource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<Option<u64>, SourceError> {
        Ok(Some(self.total))
    }

    fn next_event(&mut self) -> Result<Option<PhysicsEvent>, SourceError> {
        Ok(self.events.pop_front())
    }
}

/// Seeded generator of plausible events, for runs without input tables.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    label: String,
    total: u64,
    produced: u64,
    rng: fastrand::Rng,
}

impl SyntheticSource {
    pub fn new(label: impl Into<String>, count: u64, seed: u64) -> Self {
        Self {
            label: label.into(),
            total: count,
            produced: 0,
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl EventSource for SyntheticSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<Option<u64>, SourceError> {
        Ok(Some(self.total))
    }

    fn next_event(&mut self) -> Result<Option<PhysicsEvent>, SourceError> {
        if self.produced >= self.total {
            return Ok(None);
        }
        self.produced += 1;
        let mut values = [0.0f64; 12];
        for triple in values.chunks_exact_mut(3) {
            triple[0] = 0.1 + 2.9 * self.rng.f64();
            triple[1] = std::f64::consts::PI * self.rng.f64();
            triple[2] = std::f64::consts::TAU * self.rng.f64() - std::f64::consts::PI;
        }
        Ok(Some(event_from_spherical(&values)))
    }
}
