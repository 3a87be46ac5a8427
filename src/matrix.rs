use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

use crate::enums::Axis;
use crate::error::{AlignError, AlignResult};

/// A 4x4 affine transformation in millimetre space.
///
/// The top-left 3x3 block is the linear part (rotation, scale, shear) and
/// the last column of rows 0-2 the translation. Operations never mutate a
/// matrix in place; they return a new one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix(Matrix4<f64>);

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineMatrix {
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    pub fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self(Matrix4::from_fn(|r, c| rows[r][c]))
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self(matrix)
    }

    pub fn as_matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    pub fn rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.0[(r, c)];
            }
        }
        rows
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[(row, col)]
    }

    /// The 3x3 linear part.
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.0[(0, 3)], self.0[(1, 3)], self.0[(2, 3)])
    }

    /// Returns a copy with the translation along `axis` replaced by `value`.
    pub fn with_translation_component(&self, axis: Axis, value: f64) -> Self {
        let mut matrix = self.0;
        matrix[(axis.index(), 3)] = value;
        Self(matrix)
    }

    /// `self * other`: the result applies `other` first, then `self`.
    pub fn compose(&self, other: &AffineMatrix) -> Self {
        Self(self.0 * other.0)
    }

    /// Left-to-right product of `matrices`, so the last one is applied first.
    pub fn concat(matrices: &[AffineMatrix]) -> Self {
        matrices
            .iter()
            .fold(Self::identity(), |acc, matrix| acc.compose(matrix))
    }

    pub fn inverse(&self) -> AlignResult<Self> {
        self.0
            .try_inverse()
            .map(Self)
            .ok_or(AlignError::SingularMatrix)
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.linear() * point.coords + self.translation())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> AlignResult<Self> {
        fs::read_to_string(path.as_ref())?.parse()
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> AlignResult<()> {
        fs::write(path.as_ref(), self.to_string())?;
        Ok(())
    }

    fn parse_row(line_number: usize, line: &str) -> AlignResult<[f64; 4]> {
        let values = line
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| {
                        AlignError::MalformedMatrix(format!(
                            "line {line_number}: '{field}' is not a finite number"
                        ))
                    })
            })
            .collect::<AlignResult<Vec<f64>>>()?;

        <[f64; 4]>::try_from(values.as_slice()).map_err(|_| {
            AlignError::MalformedMatrix(format!(
                "line {line_number}: expected 4 values, found {}",
                values.len()
            ))
        })
    }
}

impl FromStr for AffineMatrix {
    type Err = AlignError;

    /// Parses 4 rows of 4 whitespace-separated numbers. Blank lines and
    /// lines starting with `#` are skipped.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let rows = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(line_number, line)| Self::parse_row(line_number, line))
            .collect::<AlignResult<Vec<_>>>()?;

        let rows = <[[f64; 4]; 4]>::try_from(rows.as_slice()).map_err(|_| {
            AlignError::MalformedMatrix(format!("expected 4 rows, found {}", rows.len()))
        })?;
        Ok(Self::from_rows(rows))
    }
}

impl fmt::Display for AffineMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            writeln!(f, "{} {} {} {}", row[0], row[1], row[2], row[3])?;
        }
        Ok(())
    }
}
