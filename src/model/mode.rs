/// Execution mode threaded through every forward pass.
///
/// `Train` uses batch statistics in normalization and applies dropout in the
/// deep-supervision heads; `Infer` uses running statistics and no dropout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    Train { keep_prob: f64 },
    Infer,
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train { .. })
    }

    pub fn keep_prob(&self) -> f64 {
        match self {
            Mode::Train { keep_prob } => *keep_prob,
            Mode::Infer => 1.0,
        }
    }
}
