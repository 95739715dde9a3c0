//! Wall-clock timing of setup and dispatch phases.

use std::fmt;
use std::time::{Duration, Instant};

/// Named wall-clock timer.
///
/// Runs from [`Stopwatch::start`] until the first [`Stopwatch::stop`];
/// later stops keep the first reading.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    name: &'static str,
    start: Instant,
    stop: Option<Instant>,
}

impl Stopwatch {
    /// Start timing now.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            stop: None,
        }
    }

    /// Stop the clock, log the reading at info level and return it.
    pub fn stop(&mut self) -> Duration {
        let stop = *self.stop.get_or_insert_with(Instant::now);
        let elapsed = stop - self.start;
        tracing::info!("{}: {:?}", self.name, elapsed);
        elapsed
    }

    /// Time since start, or the stopped reading.
    pub fn elapsed(&self) -> Duration {
        self.stop.unwrap_or_else(Instant::now) - self.start
    }

    /// Whether [`Stopwatch::stop`] has not been called yet.
    pub fn is_running(&self) -> bool {
        self.stop.is_none()
    }
}

impl fmt::Display for Stopwatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.name, self.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_freezes_the_reading() {
        let mut watch = Stopwatch::start("Command Queue");
        assert!(watch.is_running());
        std::thread::sleep(Duration::from_millis(2));

        let first = watch.stop();
        assert!(!watch.is_running());
        assert!(first >= Duration::from_millis(2));

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(watch.stop(), first);
        assert_eq!(watch.elapsed(), first);
    }

    #[test]
    fn running_watch_keeps_counting() {
        let watch = Stopwatch::start("Main");
        let before = watch.elapsed();
        std::thread::sleep(Duration::from_millis(1));
        assert!(watch.elapsed() > before);
    }

    #[test]
    fn display_names_the_phase() {
        let mut watch = Stopwatch::start("Main");
        watch.stop();
        assert!(watch.to_string().starts_with("Main: "));
    }
}
