use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    /// A single JSON array with all the records.
    Json,
    /// One JSON object per line.
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV headers must be written before any of the records")]
    LateCsvHeaders,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self.format, io, self.output))
    }
}

pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Json { records: Vec<serde_json::Value> },
    Jsonl,
}

impl Output {
    pub fn new(format: Format, io: Box<dyn std::io::Write>, path: Option<PathBuf>) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Json => Formatter::Json { records: Vec::new() },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Self { path, io, formatter }
    }

    pub fn table_headers(&mut self, headers: &[&str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records: true } => return Err(Error::LateCsvHeaders),
            Formatter::Csv { written_records } => {
                *written_records = true;
                self.write_csv_row(headers)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(headers);
            }
            Formatter::Json { .. } | Formatter::Jsonl => {}
        }
        Ok(())
    }

    /// Output one record.
    ///
    /// Tabular formats only call `table_row` and the JSON formats only call `serde_record`.
    pub fn record<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Json { records } => {
                let value = serde_json::to_value(serde_record()).map_err(Error::SerializeJson)?;
                records.push(value);
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
                // Lines are consumed as they come when polling.
                self.io.flush().map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let mut writer = csv_core::Writer::new();
        let mut buffer = vec![0; 64];
        let mut line = Vec::new();
        for (idx, value) in values.iter().enumerate() {
            if idx != 0 {
                loop {
                    let (result, written) = writer.delimiter(&mut buffer);
                    line.extend_from_slice(&buffer[..written]);
                    if result == WriteResult::InputEmpty {
                        break;
                    }
                }
            }
            let mut input = value.as_ref().as_bytes();
            loop {
                let (result, read, written) = writer.field(input, &mut buffer);
                input = &input[read..];
                line.extend_from_slice(&buffer[..written]);
                if result == WriteResult::InputEmpty {
                    break;
                }
            }
        }
        loop {
            let (result, written) = writer.terminator(&mut buffer);
            line.extend_from_slice(&buffer[..written]);
            if result == WriteResult::InputEmpty {
                break;
            }
        }
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Table { comfy } => {
                writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
            }
            Formatter::Json { records } => {
                serde_json::to_writer(&mut self.io, records).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
            Formatter::Csv { .. } | Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
