/*!
# CSV persistence

Predictive sample arrays, parameter traces and optimiser diagnostics are
written as CSV with a header row. Field banks are read from headerless CSV,
one flattened field per row.
*/

use crate::error::{BnnError, Result};
use csv::{ReaderBuilder, Writer};
use ndarray::{Array2, Array3, Axis};
use serde::Serialize;
use std::fs::File;
use std::path::Path;

fn create(path: &Path) -> Result<Writer<File>> {
    let file = File::create(path).map_err(|e| BnnError::io(path, e))?;
    Ok(Writer::from_writer(file))
}

/**
Saves per-chain sample data as a CSV file.

The data is expected in the shape **chain × sample × point**. The header row
holds `"chain"`, `"sample"` and one column per point named `"dim_0"`,
`"dim_1"`, etc.; every following row is one sample of one chain.
*/
pub fn save_csv<T: std::fmt::Display>(data: &Array3<T>, path: &Path) -> Result<()> {
    let mut wtr = create(path)?;
    let n_dims = data.shape()[2];

    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend((0..n_dims).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in data.axis_iter(Axis(0)).enumerate() {
        for (sample_idx, sample) in chain.axis_iter(Axis(0)).enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(sample.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush().map_err(|e| BnnError::io(path, e))?;
    Ok(())
}

/// Saves a pooled `[n_draws, n_points]` ensemble, one draw per row.
pub fn save_samples(samples: &Array2<f64>, path: &Path) -> Result<()> {
    let mut wtr = create(path)?;
    let mut header = vec!["sample".to_string()];
    header.extend((0..samples.ncols()).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;
    for (i, draw) in samples.outer_iter().enumerate() {
        let mut row = vec![i.to_string()];
        row.extend(draw.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush().map_err(|e| BnnError::io(path, e))?;
    Ok(())
}

/// Writes serialisable records with a header derived from their fields.
pub fn write_records<T: Serialize>(records: &[T], path: &Path) -> Result<()> {
    let mut wtr = create(path)?;
    for r in records {
        wtr.serialize(r)?;
    }
    wtr.flush().map_err(|e| BnnError::io(path, e))?;
    Ok(())
}

/// Reads a headerless numeric CSV into `[n_rows, n_cols]`. Every row must
/// have the same length.
pub fn load_fields(path: &Path) -> Result<Array2<f64>> {
    let file = File::open(path).map_err(|e| BnnError::io(path, e))?;
    let mut rdr = ReaderBuilder::new().has_headers(false).from_reader(file);
    let mut flat = Vec::new();
    let mut n_cols = None;
    let mut n_rows = 0;
    for record in rdr.records() {
        let record = record?;
        match n_cols {
            None => n_cols = Some(record.len()),
            Some(n) if n != record.len() => {
                return Err(BnnError::Shape(format!(
                    "{}: row {} has {} values, expected {n}",
                    path.display(),
                    n_rows + 1,
                    record.len()
                )))
            }
            Some(_) => {}
        }
        for field in record.iter() {
            let v = field.trim().parse::<f64>().map_err(|e| {
                BnnError::Shape(format!(
                    "{}: row {}: `{field}`: {e}",
                    path.display(),
                    n_rows + 1
                ))
            })?;
            flat.push(v);
        }
        n_rows += 1;
    }
    let n_cols = n_cols.unwrap_or(0);
    Array2::from_shape_vec((n_rows, n_cols), flat).map_err(|e| BnnError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, arr3};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn save_csv_writes_chain_and_sample_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traces.csv");
        let data = arr3(&[[[1, 2], [3, 4]], [[5, 6], [7, 8]]]);
        save_csv(&data, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "chain,sample,dim_0,dim_1");
        assert_eq!(lines[1], "0,0,1,2");
        assert_eq!(lines[4], "1,1,7,8");
    }

    #[test]
    fn records_get_a_header() {
        #[derive(Serialize)]
        struct Row {
            outer: usize,
            norm: f64,
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("norms.csv");
        write_records(&[Row { outer: 1, norm: 0.5 }], &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "outer,norm\n1,0.5\n");
    }

    #[test]
    fn fields_load_row_by_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.csv");
        fs::write(&path, "1,2,3\n4,5,6\n").unwrap();
        assert_eq!(load_fields(&path).unwrap(), arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    }

    #[test]
    fn ragged_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.csv");
        fs::write(&path, "1,2,3\n4,5\n").unwrap();
        assert!(load_fields(&path).is_err());
    }

    #[test]
    fn missing_field_bank_names_the_path() {
        let err = load_fields(Path::new("/nonexistent/fields.csv")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fields.csv"));
    }
}
