// SPDX-License-Identifier: Apache-2.0

//! Turns the old×new classification grid into a mapping from old files to new ones.

use std::fmt;

/// A cell of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mapping {
    #[default]
    None,
    Same,
    Copy,
}

impl Mapping {
    fn is_set(self) -> bool {
        self != Mapping::None
    }
}

/// Rows are files from the previous scan, columns files from the current scan.
#[derive(Clone, PartialEq, Eq)]
pub struct MappingMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Mapping>,
}

impl MappingMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![Mapping::None; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Mapping {
        self.cells[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: Mapping) {
        self.cells[row * self.cols + col] = value;
    }

    /// First new file the old file `row` maps to.
    pub fn find(&self, row: usize) -> Option<usize> {
        (0..self.cols).find(|&c| self.get(row, c).is_set())
    }

    /// Columns of `row` holding a mapping.
    pub fn mapped_cols(&self, row: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.cols).filter(move |&c| self.get(row, c).is_set())
    }

    /// The only mapped column in `row`, if exactly one.
    fn unique_in_row(&self, row: usize) -> Option<usize> {
        let mut found = None;
        for c in 0..self.cols {
            if self.get(row, c).is_set() {
                if found.is_some() {
                    return None;
                }
                found = Some(c);
            }
        }
        found
    }

    /// The only mapped row in `col`, if exactly one.
    fn unique_in_col(&self, col: usize) -> Option<usize> {
        let mut found = None;
        for r in 0..self.rows {
            if self.get(r, col).is_set() {
                if found.is_some() {
                    return None;
                }
                found = Some(r);
            }
        }
        found
    }

    /// Every row and column has exactly one mapping.
    pub fn is_unique(&self) -> bool {
        (0..self.rows).all(|r| self.unique_in_row(r).is_some())
            && (0..self.cols).all(|c| self.unique_in_col(c).is_some())
    }

    /// Make the mapping one to one.
    ///
    /// Unique pairs are kept. Other rows are assigned greedily: with no more old files
    /// than new ones, top to bottom taking the leftmost candidate; otherwise bottom to
    /// top taking the rightmost, so the oldest files are the ones left without a match.
    /// Each assignment clears the rest of its row and column.
    pub fn resolve(&mut self) {
        if self.is_unique() {
            return;
        }

        tracing::debug!(rows = self.rows, cols = self.cols, "Resolving non-unique file mapping");

        let mut protected_rows = vec![false; self.rows];
        let mut protected_cols = vec![false; self.cols];

        for r in 0..self.rows {
            if let Some(c) = self.unique_in_row(r) {
                if self.unique_in_col(c).is_some() {
                    protected_rows[r] = true;
                    protected_cols[c] = true;
                }
            }
        }

        if self.rows <= self.cols {
            for r in 0..self.rows {
                if protected_rows[r] {
                    continue;
                }
                if let Some(c) =
                    (0..self.cols).find(|&c| self.get(r, c).is_set() && !protected_cols[c])
                {
                    self.cross_out(r, c, &protected_rows, &protected_cols);
                }
            }
        } else {
            for r in (0..self.rows).rev() {
                if protected_rows[r] {
                    continue;
                }
                if let Some(c) = (0..self.cols)
                    .rev()
                    .find(|&c| self.get(r, c).is_set() && !protected_cols[c])
                {
                    self.cross_out(r, c, &protected_rows, &protected_cols);
                }
            }
        }
    }

    fn cross_out(&mut self, row: usize, col: usize, protected_rows: &[bool], protected_cols: &[bool]) {
        for c in 0..self.cols {
            if !protected_cols[c] && c != col {
                self.set(row, c, Mapping::None);
            }
        }
        for r in 0..self.rows {
            if !protected_rows[r] && r != row {
                self.set(r, col, Mapping::None);
            }
        }
    }
}

impl fmt::Debug for MappingMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in 0..self.rows {
            for c in 0..self.cols {
                let ch = match self.get(r, c) {
                    Mapping::None => '0',
                    Mapping::Same => '1',
                    Mapping::Copy => '2',
                };
                write!(f, "{ch}")?;
            }
            if r + 1 < self.rows {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(rows: usize, cols: usize) -> MappingMatrix {
        let mut m = MappingMatrix::new(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                m.set(r, c, Mapping::Same);
            }
        }
        m
    }

    fn from_str(rows: &[&str]) -> MappingMatrix {
        let cols = rows[0].len();
        let mut m = MappingMatrix::new(rows.len(), cols);
        for (r, line) in rows.iter().enumerate() {
            for (c, ch) in line.chars().enumerate() {
                let v = match ch {
                    '1' => Mapping::Same,
                    '2' => Mapping::Copy,
                    _ => Mapping::None,
                };
                m.set(r, c, v);
            }
        }
        m
    }

    #[test]
    fn test_unique_mapping_untouched() {
        let mut m = from_str(&["100", "010", "001"]);
        let before = m.clone();
        m.resolve();
        assert_eq!(m, before);
    }

    #[test]
    fn test_wide_matrix_maps_diagonally_from_top_left() {
        let mut m = filled(3, 4);
        m.resolve();
        assert_eq!(format!("{m:?}"), "1000\n0100\n0010");
        assert_eq!(m.find(0), Some(0));
        assert_eq!(m.find(2), Some(2));
    }

    #[test]
    fn test_tall_matrix_maps_diagonally_from_bottom_right() {
        let mut m = filled(6, 4);
        m.resolve();
        assert_eq!(
            format!("{m:?}"),
            "0000\n0000\n1000\n0100\n0010\n0001"
        );
        assert_eq!(m.find(0), None);
        assert_eq!(m.find(5), Some(3));
    }

    #[test]
    fn test_protected_pairs_survive() {
        // Row 0 maps only to column 2 and nothing else maps there
        let mut m = from_str(&["001", "110", "110"]);
        m.resolve();
        assert_eq!(format!("{m:?}"), "001\n100\n010");
    }

    #[test]
    fn test_copy_cells_count_as_mappings() {
        let mut m = from_str(&["22", "22"]);
        assert!(!m.is_unique());
        m.resolve();
        assert_eq!(format!("{m:?}"), "20\n02");
    }

    #[test]
    fn test_empty_row_is_unmapped() {
        let m = from_str(&["00", "01"]);
        assert_eq!(m.find(0), None);
        assert_eq!(m.mapped_cols(1).collect::<Vec<_>>(), vec![1]);
    }
}
