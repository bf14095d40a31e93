use dialoguer::Select;
use dialoguer::theme::ColorfulTheme;
use duplex_core::{TransformDecision, TransformError, TransformErrorHandler};
use indicatif::ProgressBar;
use tracing::warn;

const CHOICES: [&str; 3] = ["yes", "no", "ignore all"];

/// Asks on the terminal whether to go on after a module error.
pub struct PromptHandler {
    progress: Option<ProgressBar>,
}

impl PromptHandler {
    pub fn new(progress: Option<ProgressBar>) -> Self {
        Self { progress }
    }

    fn ask(&self, error: &TransformError) -> TransformDecision {
        eprintln!("\n{error}");
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Do you want to continue with the execution?")
            .items(&CHOICES)
            .default(0)
            .interact();
        match selection {
            Ok(index) => decision(index),
            Err(e) => {
                warn!(error = %e, "No answer from the terminal, stopping");
                TransformDecision::Stop
            }
        }
    }
}

fn decision(index: usize) -> TransformDecision {
    match index {
        0 => TransformDecision::Continue,
        2 => TransformDecision::IgnoreAll,
        _ => TransformDecision::Stop,
    }
}

impl TransformErrorHandler for PromptHandler {
    fn decide(&mut self, error: &TransformError) -> TransformDecision {
        match &self.progress {
            Some(pb) => pb.suspend(|| self.ask(error)),
            None => self.ask(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choices_map_to_decisions() {
        assert_eq!(decision(0), TransformDecision::Continue);
        assert_eq!(decision(1), TransformDecision::Stop);
        assert_eq!(decision(2), TransformDecision::IgnoreAll);
    }
}
