/// Star records and per-dataset column schema
///
/// Every record starts with a fixed canonical prefix followed by an
/// optional tail of dataset-specific columns. Tail columns are resolved to
/// offsets once when the schema is built.
use glam::Vec3;

use crate::error::{OctreeError, OctreeResult};

/// x, y, z, magnitude, color, vx, vy, vz, speed
pub const CANONICAL_VALUES_PER_STAR: usize = 9;

pub const POSITION_OFFSET: usize = 0;
pub const MAGNITUDE_OFFSET: usize = 3;
pub const COLOR_OFFSET: usize = 4;
pub const VELOCITY_OFFSET: usize = 5;
pub const SPEED_OFFSET: usize = 8;

/// One star in canonical column order
#[derive(Debug, Clone, PartialEq)]
pub struct StarRecord {
    pub position: Vec3,
    pub magnitude: f32,
    pub color: f32,
    pub velocity: Vec3,
    pub speed: f32,
    /// Optional dataset-specific columns, ordered as in the schema
    pub extra: Vec<f32>,
}

impl StarRecord {
    pub fn new(position: Vec3, magnitude: f32, color: f32) -> Self {
        Self {
            position,
            magnitude,
            color,
            velocity: Vec3::ZERO,
            speed: 0.0,
            extra: Vec::new(),
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self.speed = velocity.length();
        self
    }

    pub fn with_extra(mut self, extra: Vec<f32>) -> Self {
        self.extra = extra;
        self
    }

    pub fn width(&self) -> usize {
        CANONICAL_VALUES_PER_STAR + self.extra.len()
    }

    /// Append the flattened record to `out`
    pub fn write_values(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&self.position.to_array());
        out.push(self.magnitude);
        out.push(self.color);
        out.extend_from_slice(&self.velocity.to_array());
        out.push(self.speed);
        out.extend_from_slice(&self.extra);
    }

    /// Rebuild a record from one flattened row
    pub fn from_values(values: &[f32]) -> OctreeResult<Self> {
        if values.len() < CANONICAL_VALUES_PER_STAR {
            return Err(OctreeError::InvalidValuesPerStar {
                found: values.len(),
                minimum: CANONICAL_VALUES_PER_STAR,
            });
        }
        Ok(Self {
            position: position_of(values),
            magnitude: values[MAGNITUDE_OFFSET],
            color: values[COLOR_OFFSET],
            velocity: Vec3::new(
                values[VELOCITY_OFFSET],
                values[VELOCITY_OFFSET + 1],
                values[VELOCITY_OFFSET + 2],
            ),
            speed: values[SPEED_OFFSET],
            extra: values[CANONICAL_VALUES_PER_STAR..].to_vec(),
        })
    }
}

/// Position of a flattened row
#[inline]
pub fn position_of(row: &[f32]) -> Vec3 {
    Vec3::new(
        row[POSITION_OFFSET],
        row[POSITION_OFFSET + 1],
        row[POSITION_OFFSET + 2],
    )
}

/// Column layout of one dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StarSchema {
    extra_columns: Vec<String>,
}

impl StarSchema {
    pub fn new<I, S>(extra_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_columns: extra_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn values_per_star(&self) -> usize {
        CANONICAL_VALUES_PER_STAR + self.extra_columns.len()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    /// Offset of a column within a flattened row, canonical names included
    pub fn column_offset(&self, name: &str) -> Option<usize> {
        let canonical = match name {
            "x" => Some(POSITION_OFFSET),
            "y" => Some(POSITION_OFFSET + 1),
            "z" => Some(POSITION_OFFSET + 2),
            "magnitude" => Some(MAGNITUDE_OFFSET),
            "color" => Some(COLOR_OFFSET),
            "vx" => Some(VELOCITY_OFFSET),
            "vy" => Some(VELOCITY_OFFSET + 1),
            "vz" => Some(VELOCITY_OFFSET + 2),
            "speed" => Some(SPEED_OFFSET),
            _ => None,
        };
        canonical.or_else(|| {
            self.extra_columns
                .iter()
                .position(|column| column == name)
                .map(|i| CANONICAL_VALUES_PER_STAR + i)
        })
    }
}
