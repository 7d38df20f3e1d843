use std::io::{self, Write};

use unicode_width::UnicodeWidthChar;

use crate::scan::MatchRecord;

/// Command column width; the kernel caps comm at 15 bytes plus the
/// terminator, so nothing legitimate is ever cut.
pub const COMM_WIDTH: usize = 15;
const PID_WIDTH: usize = 7;
const NS_WIDTH: usize = 10;

/// Writes match rows as a fixed-width table. The header is lazy: it goes
/// out with the first row, so a run with no matches prints nothing.
pub struct TableWriter<W> {
    out: W,
    header: bool,
}

impl<W: Write> TableWriter<W> {
    pub fn new(out: W, with_header: bool) -> Self {
        Self {
            out,
            header: with_header,
        }
    }

    pub fn write_match(&mut self, rec: &MatchRecord) -> io::Result<()> {
        if self.header {
            self.header = false;
            writeln!(
                self.out,
                "{:>pw$} {:>nw$} {:<cw$} {}",
                "PID",
                "NSID",
                "COMMAND",
                "PATH",
                pw = PID_WIDTH,
                nw = NS_WIDTH,
                cw = COMM_WIDTH,
            )?;
        }

        let ns = if rec.ns_id == 0 {
            "-".to_string()
        } else {
            rec.ns_id.to_string()
        };
        writeln!(
            self.out,
            "{:>pw$} {:>nw$} {:<cw$} {}",
            rec.pid,
            ns,
            truncate_display(&rec.comm, COMM_WIDTH),
            rec.path.display(),
            pw = PID_WIDTH,
            nw = NS_WIDTH,
            cw = COMM_WIDTH,
        )
    }
}

/// Cut `s` to at most `max` display columns, never splitting a wide
/// character in half.
fn truncate_display(s: &str, max: usize) -> String {
    let mut width = 0;
    let mut out = String::new();
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if width + w > max {
            break;
        }
        width += w;
        out.push(c);
    }
    out
}
