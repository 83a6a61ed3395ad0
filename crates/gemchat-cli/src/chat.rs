use std::io::Write;
use std::pin::pin;

use anyhow::Result;
use gemchat_agents::markup::{Segment, segments};
use gemchat_agents::{ChatSession, GenerationHandle, GenerationOutcome, RejectReason, SendOutcome};
use gemchat_common::{Message, MessageId, MessageStatus, Role};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::key::KeyStore;

/// One line typed at the chat prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Starter(usize),
    Voice,
    Reconnect,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(line.trim_end_matches(['\r', '\n']).to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "exit" | "q"), None) => Input::Quit,
        (Some("voice"), None) => Input::Voice,
        (Some("reconnect"), None) => Input::Reconnect,
        (Some("help"), None) => Input::Help,
        (Some("starter"), Some(n)) => match n.parse::<usize>() {
            Ok(n) if n > 0 => Input::Starter(n),
            _ => Input::Unknown(trimmed.to_string()),
        },
        _ => Input::Unknown(trimmed.to_string()),
    }
}

/// Wait for the next prompt line. End of input and `interrupt` both read
/// as `/quit`.
async fn next_input<R, F>(lines: &mut Lines<R>, interrupt: F) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?.map_or(Input::Quit, |l| parse_input(&l))),
        () = interrupt => Ok(Input::Quit),
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Interactive loop over one open session.
pub async fn run(session: &ChatSession, keys: &KeyStore) -> Result<()> {
    let view = session.view();
    println!("Chatting with {}. Type /help for commands.", view.gem_name);
    for message in &view.messages {
        print_message(message);
    }
    print_starters(&view.starter_prompts);
    if !keys.has_key() {
        println!("No API key configured. Use /reconnect to enter one.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}> ", if session.voice_mode() { "(voice) " } else { "" });
        std::io::stdout().flush()?;

        let text = match next_input(&mut lines, ctrl_c()).await? {
            Input::Empty => continue,
            Input::Quit => {
                println!();
                break;
            }
            Input::Help => {
                print_help();
                continue;
            }
            Input::Voice => {
                let on = !session.voice_mode();
                session.set_voice_mode(on);
                println!("Voice mode {}.", if on { "on" } else { "off" });
                continue;
            }
            Input::Reconnect => {
                match keys.reconnect() {
                    Ok(()) => session.dismiss_credential_prompt(),
                    Err(e) => println!("Key not changed: {e:#}"),
                }
                continue;
            }
            Input::Unknown(command) => {
                println!("Unknown command {command}. Type /help for commands.");
                continue;
            }
            Input::Starter(n) => {
                let starters = session.snapshot().gem.starter_prompts;
                match starters.get(n - 1) {
                    Some(prompt) => {
                        println!("> {prompt}");
                        prompt.clone()
                    }
                    None => {
                        println!("No starter prompt #{n}.");
                        continue;
                    }
                }
            }
            Input::Message(text) => text,
        };

        match session.send(&text) {
            SendOutcome::Started(handle) => follow_reply(session, handle).await,
            SendOutcome::Rejected(RejectReason::Busy) => println!("Still answering, please wait."),
            SendOutcome::Rejected(RejectReason::EmptyInput) => {}
        }
    }
    Ok(())
}

/// Print the reply as it streams in. Ctrl-C discards it.
async fn follow_reply(session: &ChatSession, handle: GenerationHandle) {
    let reply_id = handle.message_id().clone();
    let mut updates = session.subscribe();
    let mut printed = 0;
    let mut done = pin!(handle.wait());

    let outcome = loop {
        tokio::select! {
            outcome = &mut done => break outcome,
            changed = updates.changed() => {
                if changed.is_err() {
                    break done.as_mut().await;
                }
                let reply = updates
                    .borrow_and_update()
                    .history
                    .iter()
                    .rev()
                    .find(|m| m.id == reply_id)
                    .cloned();
                if let Some(reply) = reply {
                    print_new_text(&reply, &mut printed);
                }
            }
            () = ctrl_c() => {
                session.cancel();
                break done.as_mut().await;
            }
        }
    };

    match outcome {
        GenerationOutcome::Settled { message_id } => {
            if let Some(reply) = find(session, &message_id) {
                print_new_text(&reply, &mut printed);
            }
            println!();
        }
        GenerationOutcome::Failed {
            message_id,
            needs_credential,
        } => {
            if let Some(reply) = find(session, &message_id) {
                println!("\n[{}]", reply.content);
            }
            if needs_credential {
                println!("Type /reconnect to enter an API key.");
            }
        }
        GenerationOutcome::Cancelled => println!("\n[reply discarded]"),
    }
}

fn find(session: &ChatSession, message_id: &MessageId) -> Option<Message> {
    session
        .snapshot()
        .history
        .into_iter()
        .rev()
        .find(|m| &m.id == message_id)
}

fn print_new_text(reply: &Message, printed: &mut usize) {
    if reply.status == MessageStatus::Failed {
        return;
    }
    if let Some(tail) = reply.content.get(*printed..) {
        print!("{tail}");
        let _ = std::io::stdout().flush();
        *printed = reply.content.len();
    }
}

fn print_message(message: &Message) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Model => "gem",
    };
    println!("{speaker}:");
    for segment in segments(&message.content) {
        match segment {
            Segment::Text(text) => println!("{}", text.trim_matches('\n')),
            Segment::Code { language, code } => {
                let label = if language.is_empty() { "code" } else { language };
                let preview = if segment.is_previewable() { ", previewable" } else { "" };
                println!("--- {label}{preview} ---\n{code}\n---");
            }
        }
    }
}

fn print_starters(starters: &[String]) {
    if starters.is_empty() {
        return;
    }
    println!("Try one of these with /starter N:");
    for (i, prompt) in starters.iter().enumerate() {
        println!("  {}. {prompt}", i + 1);
    }
}

fn print_help() {
    println!("/starter N   send starter prompt N");
    println!("/voice       toggle short spoken-style replies");
    println!("/reconnect   enter a new API key");
    println!("/quit        leave the chat (Ctrl-C at the prompt does too)");
    println!("Ctrl-C while a reply streams discards it.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input(" /voice "), Input::Voice);
        assert_eq!(parse_input("/reconnect"), Input::Reconnect);
        assert_eq!(parse_input("/starter 2"), Input::Starter(2));
        assert_eq!(
            parse_input("/starter 0"),
            Input::Unknown("/starter 0".to_string())
        );
        assert_eq!(parse_input("/dance"), Input::Unknown("/dance".to_string()));
    }

    #[tokio::test]
    async fn prompt_reads_lines_until_end_of_input() {
        let mut lines = BufReader::new(&b"hello\n/voice\n"[..]).lines();
        let never = std::future::pending::<()>;

        assert_eq!(
            next_input(&mut lines, never()).await.unwrap(),
            Input::Message("hello".to_string())
        );
        assert_eq!(next_input(&mut lines, never()).await.unwrap(), Input::Voice);
        assert_eq!(next_input(&mut lines, never()).await.unwrap(), Input::Quit);
    }

    #[tokio::test]
    async fn interrupt_at_the_prompt_quits() {
        let (_keyboard, stdin) = tokio::io::duplex(64);
        let mut lines = BufReader::new(stdin).lines();

        let input = next_input(&mut lines, std::future::ready(())).await.unwrap();
        assert_eq!(input, Input::Quit);
    }

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(
            parse_input("  indented question"),
            Input::Message("  indented question".to_string())
        );
    }
}
