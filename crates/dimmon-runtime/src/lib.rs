//! The main loop: block on the earliest of (next timer, next I/O), then run
//! wave start → I/O dispatch → timer dispatch → wave finish, once per
//! iteration (§4.9).

use dimmon_error::{DmmError, DmmResult};
use dimmon_graph::GraphRuntime;

/// Runs the main loop until a fatal error. Mirrors the pseudocode in §4.9:
/// exactly one OS-multiplexer wait and at most one observed event are
/// processed per wave, so that I/O and timer work for that wave finish
/// together before the next iteration starts.
///
/// Returns the error that ended the loop — termination is always by error,
/// there is no clean-exit path (an idle runtime blocks forever on `poll`).
pub fn run(graph: &mut GraphRuntime) -> DmmError {
    loop {
        if let Err(e) = run_once(graph) {
            tracing::warn!(error = %e, "main loop terminating");
            return e;
        }
    }
}

/// One iteration of the loop. Public so tests (and an embedder wanting
/// bounded iteration) can drive it directly.
pub fn run_once(graph: &mut GraphRuntime) -> DmmResult<()> {
    let timeout_ms = match graph.next_deadline() {
        Ok(deadline) => {
            let now = graph.now_ms();
            Some(deadline.saturating_sub(now).max(0) as u64)
        }
        Err(DmmError::NotFound) => None,
        Err(e) => return Err(e),
    };

    let events = loop {
        match graph.poll(timeout_ms) {
            Ok(events) => break events,
            Err(DmmError::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    };

    graph.wave_start();

    // At most one observed event is processed per wave (§4.9's
    // "capacity=1"); any remaining fds from this poll are picked up on the
    // next iteration's re-poll, which reports them again since they are
    // still level-triggered ready.
    let had_event = if let Some(&(fd, readiness)) = events.first() {
        graph.socket_event_process(fd, readiness)?;
        true
    } else {
        false
    };

    graph.timers_trigger(!had_event)?;
    graph.wave_finish()?;
    Ok(())
}
