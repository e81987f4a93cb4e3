//! `driver=stdout`: renders each cycle's statement as one line of text.
//!
//! The statement is the template's `stmt` field. `{cycle}`, `{hash}` and
//! `{op}` are replaced with the cycle number, a stable 64-bit mix of it and the
//! template name. Output goes to stdout unless `filename=` names a file.

use std::{
    fs::File,
    io::{self, LineWriter, Write},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::DriverAdapter;
use crate::{
    error::{Error, OpError, Result},
    op::{CycleOp, OpDispenser, OpOutput, OpTemplate},
    params::ActivityDef,
};

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

pub struct StdoutDriver {
    sink: Sink,
}

impl StdoutDriver {
    pub fn open(def: &ActivityDef) -> Result<Self> {
        let out: Box<dyn Write + Send> = match def.params().get("filename") {
            None | Some("stdout") => Box::new(io::stdout()),
            Some(path) => {
                tracing::debug!("{} writing to {path}", def.alias());
                Box::new(LineWriter::new(File::create(path)?))
            }
        };
        Ok(Self {
            sink: Arc::new(Mutex::new(out)),
        })
    }
}

impl DriverAdapter for StdoutDriver {
    fn name(&self) -> &str {
        "stdout"
    }

    fn map_op(&self, template: &OpTemplate, _def: &ActivityDef) -> Result<Arc<dyn OpDispenser>> {
        let stmt = template.field_str("stmt").ok_or_else(|| Error::MissingParam(format!(
            "stmt for op '{}'",
            template.name
        )))?;
        Ok(Arc::new(StdoutDispenser {
            name: template.name.clone(),
            stmt,
            sink: self.sink.clone(),
        }))
    }
}

pub struct StdoutDispenser {
    name: String,
    stmt: String,
    sink: Sink,
}

impl StdoutDispenser {
    /// The line for `cycle`, without the trailing newline.
    pub fn render(&self, cycle: u64) -> String {
        self.stmt
            .replace("{cycle}", &cycle.to_string())
            .replace("{hash}", &mix64(cycle).to_string())
            .replace("{op}", &self.name)
    }
}

impl OpDispenser for StdoutDispenser {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, cycle: u64) -> Result<Box<dyn CycleOp>, OpError> {
        let mut line = self.render(cycle);
        line.push('\n');
        Ok(Box::new(StdoutOp {
            line,
            sink: self.sink.clone(),
        }))
    }
}

struct StdoutOp {
    line: String,
    sink: Sink,
}

#[async_trait]
impl CycleOp for StdoutOp {
    async fn execute(&self) -> Result<OpOutput, OpError> {
        // file writes may block, keep them off the runtime's workers
        let sink = self.sink.clone();
        let line = self.line.clone();
        let bytes = line.len() as u64;
        tokio::task::spawn_blocking(move || {
            let mut out = sink.lock();
            out.write_all(line.as_bytes())
        })
            .await
            .map_err(|e| OpError::new("IoError", e.to_string()))?
            .map_err(|e| OpError::new("IoError", e.to_string()))?;
        Ok(OpOutput {
            code: 0,
            bytes,
            body: None,
        })
    }
}

/// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispenser(stmt: &str, path: &std::path::Path) -> Arc<dyn OpDispenser> {
        let def = ActivityDef::parse(&format!("alias=s;filename={}", path.display())).unwrap();
        let driver = StdoutDriver::open(&def).unwrap();
        let template = OpTemplate::new("insert").with_field("stmt", stmt);
        driver.map_op(&template, &def).unwrap()
    }

    #[test]
    fn binding_is_a_function_of_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let def = ActivityDef::parse(&format!(
            "alias=s;filename={}",
            dir.path().join("out").display()
        ))
        .unwrap();
        let driver = StdoutDriver::open(&def).unwrap();
        let d = StdoutDispenser {
            name: "insert".into(),
            stmt: "{op} {cycle} {hash}".into(),
            sink: driver.sink.clone(),
        };
        assert_eq!(d.render(42), d.render(42));
        assert_ne!(d.render(42), d.render(43));
        assert!(d.render(7).starts_with("insert 7 "));
    }

    #[tokio::test]
    async fn executes_one_line_per_cycle_into_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.txt");
        let d = dispenser("row {cycle}", &path);
        for cycle in 0..3 {
            let op = d.bind(cycle).unwrap();
            let out = op.execute().await.unwrap();
            assert_eq!(out.code, 0);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "row 0\nrow 1\nrow 2\n");
    }

    #[tokio::test]
    async fn concurrent_ops_write_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.txt");
        let d = dispenser("row {cycle}", &path);
        let ops: Vec<_> = (0..50).map(|cycle| d.bind(cycle).unwrap()).collect();
        let outputs = futures::future::join_all(ops.iter().map(|op| op.execute())).await;
        assert!(outputs.iter().all(|o| o.as_ref().is_ok_and(|o| o.bytes > 0)));

        let mut lines: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines.sort_by_key(|l| l[4..].parse::<u64>().unwrap());
        let expected: Vec<String> = (0..50).map(|c| format!("row {c}")).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn missing_stmt_is_rejected() {
        let def = ActivityDef::parse("alias=s").unwrap();
        let driver = StdoutDriver::open(&def).unwrap();
        assert!(driver.map_op(&OpTemplate::new("bare"), &def).is_err());
    }
}
