pub mod command;
pub mod conversation_state;
pub mod interrupt;
pub mod prompt;

use std::io::Write;
use std::process::ExitCode;

use color_print::cformat;
use command::Command;
use conversation_state::{ConversationState, Role};
use eyre::Result;
use interrupt::InterruptRouter;
use prompt::generate_prompt;
use rustyline::error::ReadlineError;

use crate::backend::{Backend, DEFAULT_FEED_LIMIT};
use crate::chat_client::ChatClient;
use crate::stream::StreamOutcome;

const WELCOME_TEXT: &str = "
Hi, I'm the gallery's AI Art Assistant.
Ask me anything about art, artworks, or creative inspiration!

/feed         Show recent community posts
/help         Show the help dialogue
/quit         Quit the application
";

const HELP_TEXT: &str = "
Gallery Chat

/clear                                Clear the conversation history
/feed [limit]                         Show recent community posts
/signin <email> <password>            Sign in to your account
/signup <email> <password> <name>     Create an account
/signout                              Sign out
/whoami                               Show the signed-in account
/help                                 Show this help dialogue
/quit                                 Quit the application

Press Ctrl-C while a reply is streaming to stop it.
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Failed,
    Quit,
}

pub struct ChatContext {
    output: Box<dyn Write>,
    input: Option<String>,
    interactive: bool,
    conversation_state: ConversationState,
    chat_client: ChatClient,
    backend: Box<dyn Backend>,
    interrupts: InterruptRouter,
}

impl ChatContext {
    pub fn new(
        output: Box<dyn Write>,
        input: Option<String>,
        interactive: bool,
        chat_client: ChatClient,
        backend: Box<dyn Backend>,
    ) -> Self {
        Self {
            output,
            input,
            interactive,
            conversation_state: ConversationState::new(),
            chat_client,
            backend,
            interrupts: InterruptRouter::new(),
        }
    }

    pub async fn run(&mut self) -> Result<ExitCode> {
        let listener = self.interrupts.listen();
        let result = self.run_session().await;
        listener.abort();
        result
    }

    async fn run_session(&mut self) -> Result<ExitCode> {
        // Handle non-interactive mode (single query)
        if let Some(input) = self.input.take() {
            let flow = self.handle_input(&input).await?;
            return Ok(exit_code(flow));
        }

        if self.interactive {
            self.print_welcome()?;
            self.run_interactive().await?;
        }

        Ok(ExitCode::SUCCESS)
    }

    /// Print the community feed once and report how it went.
    pub async fn run_feed(&mut self, limit: usize) -> Result<ExitCode> {
        let flow = self.show_feed(limit).await?;
        Ok(exit_code(flow))
    }

    fn print_welcome(&mut self) -> Result<()> {
        writeln!(self.output, "{}", WELCOME_TEXT)?;
        Ok(())
    }

    async fn run_interactive(&mut self) -> Result<()> {
        let mut rl = prompt::rl()?;

        loop {
            let user = self
                .backend
                .current_session()
                .await
                .map(|session| session.user.display_name().to_string());
            let readline = rl.readline(&generate_prompt(user.as_deref()));

            match readline {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line.as_str());

                    if self.handle_input(&line).await? == Flow::Quit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    writeln!(self.output, "Error: {}", e)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_input(&mut self, input: &str) -> Result<Flow> {
        let command = match Command::parse(input) {
            Ok(command) => command,
            Err(e) => return self.report(&e),
        };

        match command {
            Command::Help => {
                writeln!(self.output, "{}", HELP_TEXT)?;
            }
            Command::Clear => {
                if self.conversation_state.is_empty() {
                    writeln!(self.output, "Nothing to clear.")?;
                } else {
                    let count = self.conversation_state.len();
                    self.conversation_state.clear();
                    writeln!(self.output, "Conversation cleared ({} messages).", count)?;
                }
            }
            Command::Quit => return Ok(Flow::Quit),
            Command::Feed { limit } => {
                return self.show_feed(limit.unwrap_or(DEFAULT_FEED_LIMIT)).await;
            }
            Command::SignIn { email, password } => {
                match self.backend.sign_in(&email, &password).await {
                    Ok(session) => {
                        writeln!(self.output, "Signed in as {}.", session.user.display_name())?;
                    }
                    Err(e) => return self.report(&e),
                }
            }
            Command::SignUp {
                email,
                password,
                full_name,
            } => match self.backend.sign_up(&email, &password, &full_name).await {
                Ok(Some(session)) => {
                    let name = session.user.display_name();
                    writeln!(self.output, "Welcome, {}! You are signed in.", name)?;
                }
                Ok(None) => {
                    writeln!(
                        self.output,
                        "Account created. Check {} to confirm it, then /signin.",
                        email
                    )?;
                }
                Err(e) => return self.report(&e),
            },
            Command::SignOut => match self.backend.sign_out().await {
                Ok(()) => writeln!(self.output, "Signed out successfully.")?,
                Err(e) => return self.report(&e),
            },
            Command::WhoAmI => match self.backend.current_user().await {
                Ok(user) => {
                    let email = user.email.as_deref().unwrap_or("no e-mail");
                    writeln!(self.output, "{} <{}>", user.display_name(), email)?;
                }
                Err(e) => return self.report(&e),
            },
            Command::Ask { prompt } => return self.process_chat_input(&prompt).await,
        }

        Ok(Flow::Continue)
    }

    async fn show_feed(&mut self, limit: usize) -> Result<Flow> {
        let posts = match self.backend.recent_posts(limit).await {
            Ok(posts) => posts,
            Err(e) => return self.report(&e),
        };

        if posts.is_empty() {
            writeln!(self.output, "No community posts yet. Be the first to share!")?;
            return Ok(Flow::Continue);
        }

        for post in &posts {
            let date = post.created_at.format("%b %-d, %Y").to_string();
            let header = cformat!("<bold>{}</bold>  <dim>{}</dim>", post.author(), date);
            writeln!(self.output, "{}", header)?;
            writeln!(self.output, "  {}\n", post.content)?;
        }

        Ok(Flow::Continue)
    }

    async fn process_chat_input(&mut self, input: &str) -> Result<Flow> {
        let cancel = self.interrupts.begin();

        let output = &mut self.output;
        let mut write_error = None;
        let result = self
            .chat_client
            .send(&mut self.conversation_state, input, &cancel, |delta| {
                if let Err(e) = write!(output, "{}", delta).and_then(|_| output.flush()) {
                    write_error.get_or_insert(e);
                }
            })
            .await;
        self.interrupts.end();

        if let Some(e) = write_error {
            return Err(e.into());
        }

        match result {
            Ok(StreamOutcome::Cancelled) => {
                writeln!(self.output, "\n[reply cancelled]")?;
                Ok(Flow::Continue)
            }
            Ok(_) => {
                let replied = self
                    .conversation_state
                    .last()
                    .is_some_and(|message| message.role == Role::Assistant);
                if replied {
                    writeln!(self.output)?;
                } else {
                    writeln!(self.output, "(no reply)")?;
                }
                Ok(Flow::Continue)
            }
            Err(e) => self.report(&e),
        }
    }

    fn report(&mut self, err: &dyn std::error::Error) -> Result<Flow> {
        writeln!(self.output, "{}", cformat!("<red><bold>Error:</bold></red> {}", err))?;
        Ok(Flow::Failed)
    }
}

fn exit_code(flow: Flow) -> ExitCode {
    match flow {
        Flow::Failed => ExitCode::FAILURE,
        Flow::Continue | Flow::Quit => ExitCode::SUCCESS,
    }
}
