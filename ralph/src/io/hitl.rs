//! Sources of human-in-the-loop input, polled once per iteration boundary.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::types::TaskStatus;
use crate::io::run_state::RunState;

/// Supplies at most one raw operator line per iteration boundary.
pub trait HitlSource {
    fn poll(&mut self, state: &RunState) -> Result<Option<String>>;
}

/// Unattended runs: never supplies input.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHitl;

impl HitlSource for NoHitl {
    fn poll(&mut self, _state: &RunState) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Interactive source: prints a dashboard to stderr and reads one line.
pub struct StdinHitl<R, W> {
    input: R,
    output: W,
}

impl StdinHitl<std::io::StdinLock<'static>, std::io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stderr())
    }
}

impl<R: BufRead, W: Write> StdinHitl<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> HitlSource for StdinHitl<R, W> {
    fn poll(&mut self, state: &RunState) -> Result<Option<String>> {
        write!(self.output, "{}", dashboard(state)).context("write dashboard")?;
        write!(
            self.output,
            "[enter] continue · /reset /replan /skip /clear · quit · or type a directive\n> "
        )
        .context("write prompt")?;
        self.output.flush().context("flush prompt")?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).context("read operator input")?;
        // EOF: keep going unattended.
        if read == 0 || line.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

fn dashboard(state: &RunState) -> String {
    let task = state
        .plan
        .current()
        .map(|task| format!("{} {}", task.id, task.description))
        .unwrap_or_else(|| "none".to_string());
    let done = state.plan.count(TaskStatus::Done);
    let mut out = format!(
        "\n── iteration {} · task {task} · done {done}/{} · stagnation {}",
        state.iteration + 1,
        state.plan.tasks.len(),
        state.stagnation_count
    );
    if let Some(loop_type) = state.loop_type {
        out.push_str(&format!(" ({})", loop_type.as_str()));
    }
    out.push('\n');
    if let Some(last) = state.last_observation() {
        let status = if last.success { "ok" } else { "failed" };
        out.push_str(&format!("last: {} [{status}]\n", last.action));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Plan;

    fn state() -> RunState {
        RunState::new("r", "g", Plan::seeded(&["scaffold".to_string()]), 4)
    }

    #[test]
    fn stdin_source_reads_one_line() {
        let mut out = Vec::new();
        let mut source = StdinHitl::new("/skip\nnext\n".as_bytes(), &mut out);

        let first = source.poll(&state()).expect("poll");

        assert_eq!(first.as_deref(), Some("/skip"));
        let shown = String::from_utf8(out).expect("utf8");
        assert!(shown.contains("iteration 1 · task T1 scaffold · done 0/1"));
    }

    #[test]
    fn empty_line_and_eof_mean_proceed() {
        let mut sink = Vec::new();
        let mut source = StdinHitl::new("\n".as_bytes(), &mut sink);
        assert_eq!(source.poll(&state()).expect("poll"), None);
        assert_eq!(source.poll(&state()).expect("poll"), None);
        assert_eq!(NoHitl.poll(&state()).expect("poll"), None);
    }
}
