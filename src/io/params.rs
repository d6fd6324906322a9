use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::model::OptAlgorithm;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeRateParamsFile {
    pub ncat: usize,
    pub rates: Vec<f64>,
    pub prop: Vec<f64>,
    pub sorted_rates: bool,
    pub algorithm: OptAlgorithm,
}

pub fn save_params(path: &Path, params: &FreeRateParamsFile) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, params)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

pub fn load_params(path: &Path) -> Result<FreeRateParamsFile> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let params =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(params)
}
