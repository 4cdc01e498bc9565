use std::fmt;

use serde::{Deserialize, Serialize};

/// One stage of the fixed interview sequence. Transitions are strictly
/// forward, one step at a time; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Fit,
    Tech,
    Brainteaser,
    Done,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Fit => Some(Phase::Tech),
            Phase::Tech => Some(Phase::Brainteaser),
            Phase::Brainteaser => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fit => "FIT",
            Phase::Tech => "TECH",
            Phase::Brainteaser => "BRAINTEASER",
            Phase::Done => "DONE",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::Fit => "Cultural Fit Assessment",
            Phase::Tech => "Technical Evaluation",
            Phase::Brainteaser => "Problem Solving Challenge",
            Phase::Done => "Interview Complete",
        }
    }

    /// Instructions for the interviewer backend while this phase is active.
    pub fn system_prompt(self) -> &'static str {
        match self {
            Phase::Fit => {
                "You are a professional HR interviewer conducting a cultural fit assessment. \
                 Ask questions about the candidate's background and motivation. \
                 Keep it conversational and natural."
            }
            Phase::Tech => {
                "You are a technical interviewer. The candidate can see SQL and Python code \
                 on screen. Ask them to explain the code and identify any issues."
            }
            Phase::Brainteaser => {
                "You are interviewing with a logic puzzle. Three doors - A always tells \
                 truth, B always lies, C sometimes lies. One door has treasure. Guide them \
                 through the puzzle."
            }
            Phase::Done => "The interview is complete. Thank the candidate warmly.",
        }
    }

    /// The fixed utterance spoken when entering this phase.
    pub fn opening_line(self) -> &'static str {
        match self {
            Phase::Fit => {
                "Hello! I'm excited to chat with you today. Let's start with some questions \
                 about your background and what motivates you. Can you tell me a bit about \
                 yourself?"
            }
            Phase::Tech => {
                "Great! Now let's move into the technical portion. I'll show you some code \
                 examples, and we can discuss your approach to solving technical problems."
            }
            Phase::Brainteaser => {
                "Excellent work so far! For our final section, I have a logic puzzle for \
                 you. Take your time and think through it out loud - I want to understand \
                 your reasoning process."
            }
            Phase::Done => {
                "Thank you so much for your time today! We've completed all sections of the \
                 interview. You'll hear back from our team soon."
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Walks the fixed phase sequence, keeping track of every phase entered so
/// far for the scoring metadata.
#[derive(Debug)]
pub struct PhaseController {
    current: Phase,
    entered: Vec<Phase>,
}

impl PhaseController {
    pub fn new() -> Self {
        Self {
            current: Phase::Fit,
            entered: vec![Phase::Fit],
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Moves to the next phase in the fixed order. Returns whether the phase
    /// actually changed; a no-op at the terminal phase.
    pub fn advance(&mut self) -> bool {
        match self.current.next() {
            Some(next) => {
                tracing::info!("phase transition: {} -> {}", self.current, next);
                self.current = next;
                self.entered.push(next);
                true
            }
            None => false,
        }
    }

    /// Names of every phase entered so far, in order.
    pub fn completed_phases(&self) -> Vec<String> {
        self.entered.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// Renders the out-of-band instruction sent to the interviewer backend
    /// when the current phase was just entered.
    pub fn transition_message(&self) -> String {
        format!(
            "PHASE TRANSITION: The interview is now moving to the {} phase.\n\n{}\n\nStart this phase by saying: \"{}\"",
            self.current,
            self.current.system_prompt(),
            self.current.opening_line(),
        )
    }
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new()
    }
}
