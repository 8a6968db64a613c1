pub mod question;
pub mod session;

pub use question::{
    AnswerValue, Batch, GapFill, MatchPair, NormalizedAnswer, Question, QuestionKind,
};
pub use session::{PollReply, Session, SessionSummary};
