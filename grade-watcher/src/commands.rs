use std::iter::once;

use clap::{Args, Parser, Subcommand, ValueEnum};
use grade_monitor::store::UserId;
use grade_monitor_utils::credentials::Credentials;
use splitty::split_unquoted_whitespace;
use tokio::sync::oneshot;

/// What a user asked for, after parsing.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Register(Credentials),
    SelectSemester(String),
    SelectMode { final_grades_only: bool },
    Refresh,
    Refetch,
    SetIntervals {
        normal_minutes: u64,
        after_failure_minutes: u64,
    },
}

/// A command on its way to the scheduler, with the channel for its answer.
#[derive(Debug)]
pub struct Request {
    pub user_id: UserId,
    pub command: Command,
    pub reply: oneshot::Sender<String>,
}

mod slash_command {
    use super::{Args, Parser, Subcommand, ValueEnum};

    #[derive(Parser)]
    #[command(name = "grades")]
    pub struct Opts {
        #[clap(subcommand)]
        pub sub: Sub,
    }
    #[derive(Subcommand)]
    pub enum Sub {
        /// Starts watching, or replaces the stored credentials.
        Register(Register),
        /// Shows another semester.
        #[command(alias = "select-semester")]
        Semester(Semester),
        #[command(alias = "select-mode")]
        Mode(Mode),
        #[command(alias = "refresh-grades")]
        Refresh,
        /// Discovers the course pages again, then refreshes.
        #[command(alias = "refetch-courses")]
        Refetch,
        /// Sets the refresh interval and the shorter one used after errors.
        Interval(Interval),
    }
    #[derive(Args)]
    pub struct Register {
        pub student_id: String,
        pub password: String,
    }
    #[derive(Args)]
    pub struct Semester {
        /// For example `Fall 2024`; quotes are optional.
        #[arg(required = true, num_args = 1..)]
        pub name: Vec<String>,
    }
    #[derive(Args)]
    pub struct Mode {
        #[arg(value_enum)]
        pub mode: GradesMode,
    }
    #[derive(Clone, Copy, ValueEnum)]
    pub enum GradesMode {
        #[value(alias = "Mode 1: Final Grades")]
        Final,
        #[value(alias = "Mode 2: All Grades")]
        All,
    }
    #[derive(Args)]
    pub struct Interval {
        pub normal_minutes: u64,
        pub after_failure_minutes: u64,
    }
}

pub fn parse(text: &str) -> anyhow::Result<Command> {
    use slash_command::{GradesMode, Sub};

    let args = slash_command::Opts::try_parse_from(
        once("grades").chain(split_unquoted_whitespace(text).unwrap_quotes(true)),
    )?;
    Ok(match args.sub {
        Sub::Register(sub_args) => Command::Register(
            Credentials::builder()
                .student_id(sub_args.student_id.into())
                .password(sub_args.password.into())
                .build(),
        ),
        Sub::Semester(sub_args) => Command::SelectSemester(sub_args.name.join(" ")),
        Sub::Mode(sub_args) => Command::SelectMode {
            final_grades_only: matches!(sub_args.mode, GradesMode::Final),
        },
        Sub::Refresh => Command::Refresh,
        Sub::Refetch => Command::Refetch,
        Sub::Interval(sub_args) => Command::SetIntervals {
            normal_minutes: sub_args.normal_minutes,
            after_failure_minutes: sub_args.after_failure_minutes,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::{parse, Command};

    #[test]
    fn registration() {
        let Command::Register(credentials) = parse("register 2100123 'pass word'").unwrap() else {
            panic!("not a registration");
        };
        assert_eq!(credentials.student_id.to_string(), "2100123");
        assert_eq!(credentials.password.expose(), "pass word");
    }

    #[test]
    fn selections() {
        assert_eq!(
            parse("semester Fall 2024").unwrap(),
            Command::SelectSemester("Fall 2024".into())
        );
        assert_eq!(
            parse("select-semester \"Spring 2025\"").unwrap(),
            Command::SelectSemester("Spring 2025".into())
        );
        assert_eq!(
            parse("mode final").unwrap(),
            Command::SelectMode {
                final_grades_only: true
            }
        );
        assert_eq!(
            parse("select-mode \"Mode 2: All Grades\"").unwrap(),
            Command::SelectMode {
                final_grades_only: false
            }
        );
    }

    #[test]
    fn buttons_and_intervals() {
        assert_eq!(parse("refresh-grades").unwrap(), Command::Refresh);
        assert_eq!(parse("refetch").unwrap(), Command::Refetch);
        assert_eq!(
            parse("interval 30 2").unwrap(),
            Command::SetIntervals {
                normal_minutes: 30,
                after_failure_minutes: 2
            }
        );
    }

    #[test]
    fn bad_input() {
        assert!(parse("").is_err());
        assert!(parse("semester").is_err());
        assert!(parse("mode sometimes").is_err());
        assert!(parse("interval thirty 1").is_err());
    }
}
