//! Utility routines for loading and storing measurement data as CSV.
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::prelude::*;
use std::error::Error;

/// Loads a headerless CSV file of numbers into a matrix.
///
/// Every row must have the same number of columns.
pub fn load_matrix(fname: &str) -> Result<Array2<f64>, Box<dyn Error>> {
    let mut reader = ReaderBuilder::new()
                                   .has_headers(false)
                                   .from_path(fname)?;
    let mut values: Vec<f64> = Vec::new();
    let mut ncols: Option<usize> = None;

    for result in reader.records() {
        let record = result?;
        for field in record.iter() {
            values.push(field.trim().parse::<f64>().map_err(|_| {
                format!("could not parse file {}, at line: {:?}",
                        fname, record)
            })?);
        }
        if let Some(x) = ncols {
            if x != record.len() {
                return Err(format!("file {} has ragged rows", fname).into());
            }
        } else {
            ncols = Some(record.len());
        }
    }

    match ncols {
        Some(d) => {
            let n = values.len() / d;
            Ok(Array::from_vec(values).into_shape((n, d))?)
        }
        None => Err(format!("file {} is empty", fname).into()),
    }
}

/// Stores a matrix as a headerless CSV file.
pub fn store_matrix(fname: &str, matrix: &ArrayView2<f64>)
                    -> Result<(), Box<dyn Error>> {
    let mut writer = WriterBuilder::new()
                                   .has_headers(false)
                                   .from_path(fname)?;
    for row in matrix.outer_iter() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Normalizes a bit matrix to the ±1 encoding.
///
/// Accepts entries in {-1,+1} (returned unchanged) or in {0,1}
/// (converted via `1 - 2b`, so 0 maps to +1); anything else is an error.
pub fn to_signed_bits(matrix: Array2<f64>)
                      -> Result<Array2<f64>, Box<dyn Error>> {
    if matrix.iter().all(|&v| v == 1. || v == -1.) {
        Ok(matrix)
    } else if matrix.iter().all(|&v| v == 0. || v == 1.) {
        Ok(matrix.mapv(|v| 1. - 2. * v))
    } else {
        Err("matrix entries must be in {-1,+1} or {0,1}".into())
    }
}
