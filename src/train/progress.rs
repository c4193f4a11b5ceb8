//! Console progress lines and remaining-time estimates.

use std::time::Duration;

/// Format whole seconds as `H:MM:SS`, prefixed with `N day, ` / `N days, `
/// once the span reaches a day.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let rem = total % 86_400;
    let clock = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        n => format!("{} days, {}", n, clock),
    }
}

/// Estimate of the time left in the run, extrapolated from one step.
///
/// The step count covers the rest of this epoch plus every later epoch:
/// `(epochs - epoch) * batches - step`.
pub fn remaining_time(
    epochs: usize,
    epoch: usize,
    batches: usize,
    step: usize,
    step_elapsed: Duration,
) -> Duration {
    let remaining_steps = (epochs.saturating_sub(epoch) * batches).saturating_sub(step);
    let secs = remaining_steps as f64 * step_elapsed.as_secs_f64();
    Duration::from_secs(secs as u64)
}

/// `[epoch+1/epochs][step/batches]\tLoss = x.xxxx\tRemain time: H:MM:SS`
pub fn step_line(
    epoch: usize,
    epochs: usize,
    step: usize,
    batches: usize,
    loss: f32,
    remain: Duration,
) -> String {
    format!(
        "[{}/{}][{}/{}]\tLoss = {:.4}\tRemain time: {}",
        epoch + 1,
        epochs,
        step,
        batches,
        loss,
        format_duration(remain)
    )
}

/// `Epoch N: Loss= x, CER = y` with the zero-based epoch.
pub fn epoch_line(epoch: usize, mean_loss: f64, cer: f64) -> String {
    format!("Epoch {}: Loss= {}, CER = {}", epoch, mean_loss, cer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_duration(Duration::from_millis(59_999)), "0:00:59");
        assert_eq!(format_duration(Duration::from_secs(86_400 + 61)), "1 day, 0:01:01");
        assert_eq!(
            format_duration(Duration::from_secs(3 * 86_400 + 36_000)),
            "3 days, 10:00:00"
        );
    }

    #[test]
    fn test_remaining_time() {
        // 2 epochs left of 10 batches, at step 3: 17 steps of 2 s each.
        let remain = remaining_time(5, 3, 10, 3, Duration::from_secs(2));
        assert_eq!(remain, Duration::from_secs(34));
        assert_eq!(
            remaining_time(1, 0, 1, 0, Duration::from_millis(500)),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_step_line() {
        let line = step_line(0, 200, 100, 512, 1.234567, Duration::from_secs(3661));
        assert_eq!(line, "[1/200][100/512]\tLoss = 1.2346\tRemain time: 1:01:01");
    }

    #[test]
    fn test_epoch_line() {
        assert_eq!(epoch_line(4, 0.5, 0.25), "Epoch 4: Loss= 0.5, CER = 0.25");
    }
}
