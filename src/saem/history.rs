use nalgebra::DMatrix;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Append-only text dump of the sampled individual-parameter block, one line
/// per `phiM` row, whitespace-delimited. The file is advisory output for
/// chain diagnostics; consumers may ignore it.
pub(crate) struct ChainDump {
    writer: Option<BufWriter<File>>,
}

impl ChainDump {
    pub fn create(path: Option<&Path>) -> io::Result<Self> {
        let writer = match path {
            Some(p) => Some(BufWriter::new(File::create(p)?)),
            None => None,
        };
        Ok(Self { writer })
    }

    /// Flushed after every block so an aborted fit keeps every completed
    /// iteration on disk.
    pub fn append(&mut self, phi_m: &DMatrix<f64>) -> io::Result<()> {
        let Some(w) = self.writer.as_mut() else {
            return Ok(());
        };
        for r in 0..phi_m.nrows() {
            for c in 0..phi_m.ncols() {
                if c > 0 {
                    write!(w, " ")?;
                }
                write!(w, "{:e}", phi_m[(r, c)])?;
            }
            writeln!(w)?;
        }
        w.flush()
    }
}
