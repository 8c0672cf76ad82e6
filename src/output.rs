use std::io::{self, Write};

use serde::Serialize;

use crate::engine::{BuildOutput, ClinicalExport, FilterCacheStatus};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_build(result: &BuildOutput) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clinical(result: &ClinicalExport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_genes(result: &FilterCacheStatus) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
