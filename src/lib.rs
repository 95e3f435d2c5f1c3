// outpost: Personal command-execution gateway
//
// A small command language ("invoke feature X with payload Y") served over
// several independent wire fronts - recursive DNS, HTTP, SMTP receive, a
// raw-TCP sock tunnel and a chat bot. Every front shapes its input through
// the same command pipeline before a feature registry does the actual work.

pub mod bot;
pub mod config;
pub mod dnsd;
pub mod error;
pub mod feature;
pub mod handlers;
pub mod health;
pub mod httpd;
pub mod mailer;
pub mod pipeline;
pub mod ratelimit;
pub mod ringlog;
pub mod shell;
pub mod smtpd;
pub mod sockd;
pub mod supervisor;
pub mod twilio;

pub use config::Config;
pub use error::{OutpostError, OutpostResult};
pub use pipeline::{Command, CommandPipeline, CommandResult};
pub use supervisor::{SharedState, Supervisor};
