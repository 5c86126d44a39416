//! examc: interactive command-line client for the examination server.
//!
//! `examc --list` enumerates the tests available to the current user;
//! `examc <test-name>` runs one attempt, prompting for answers on stdin.

use std::error::Error;
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream};

use clap::Parser;
use serde_json::Value;

use examd::protocol::Request;

#[derive(Parser, Debug)]
#[command(name = "examc")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for the examination server", long_about = None)]
struct Cli {
    /// Name of the test to take
    name: Option<String>,

    /// List available tests
    #[arg(short, long)]
    list: bool,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:65431")]
    server: String,

    /// Username (defaults to $USER)
    #[arg(short, long)]
    user: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let user = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());

    let outcome = if cli.list {
        list_tests(&cli.server, &user)
    } else if let Some(name) = cli.name.as_deref() {
        run_test(&cli.server, &user, name)
    } else {
        eprintln!("usage: examc [--list] <test-name>");
        std::process::exit(2);
    };

    if let Err(e) = outcome {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn request(user: &str, command: &str, test: Option<&str>) -> Request {
    Request {
        user: user.to_string(),
        command: command.to_string(),
        test: test.map(str::to_string),
        question_index: None,
        chosen_indices: None,
    }
}

/// One exchange: connect, send the request, half-close, read the response.
fn send(server: &str, request: &Request) -> Result<Value, Box<dyn Error>> {
    let mut stream = TcpStream::connect(server)?;
    stream.write_all(&serde_json::to_vec(request)?)?;
    stream.shutdown(Shutdown::Write)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(serde_json::from_str(&response)?)
}

fn error_of(value: &Value) -> Option<(&str, &str)> {
    let code = value.get("error")?.as_str()?;
    let message = value.get("message").and_then(Value::as_str).unwrap_or("");
    Some((code, message))
}

fn list_tests(server: &str, user: &str) -> Result<(), Box<dyn Error>> {
    let value = send(server, &request(user, "list_tests", None))?;
    if let Some((_, message)) = error_of(&value) {
        return Err(message.to_string().into());
    }

    let tests = value["tests"].as_array().cloned().unwrap_or_default();
    if tests.is_empty() {
        println!("No tests available.");
    } else {
        println!("Available tests:");
        for test in tests {
            if let Some(name) = test.as_str() {
                println!("- {name}");
            }
        }
    }
    Ok(())
}

fn run_test(server: &str, user: &str, name: &str) -> Result<(), Box<dyn Error>> {
    let value = send(server, &request(user, "get_banner", Some(name)))?;
    if let Some((_, message)) = error_of(&value) {
        return Err(message.to_string().into());
    }
    if let Some(description) = value["description"].as_str() {
        if !description.is_empty() {
            println!("{description}");
            println!();
        }
    }

    let value = send(server, &request(user, "get_variant", Some(name)))?;
    if let Some((_, message)) = error_of(&value) {
        return Err(message.to_string().into());
    }
    let questions = value["questions"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    for (index, question) in questions.iter().enumerate() {
        let prompt = question["prompt"].as_str().unwrap_or("");
        let options = question["options"].as_array().cloned().unwrap_or_default();

        println!("{}. {prompt}", index + 1);
        for (i, option) in options.iter().enumerate() {
            println!("   {}) {}", i + 1, option.as_str().unwrap_or(""));
        }

        let chosen = ask_answer(&mut lines, options.len())?;
        let mut answer = request(user, "check_answer", Some(name));
        answer.question_index = Some(index);
        answer.chosen_indices = Some(chosen);

        let value = send(server, &answer)?;
        if let Some((code, message)) = error_of(&value) {
            // A resumed session has earlier slots already recorded; keep
            // going with the next question.
            if code == "out_of_order" {
                continue;
            }
            return Err(message.to_string().into());
        }
    }

    let value = send(server, &request(user, "end_test", Some(name)))?;
    if let Some((_, message)) = error_of(&value) {
        return Err(message.to_string().into());
    }

    match value["score"].as_u64() {
        Some(score) => println!("Test completed. Your score: {score}/{}", questions.len()),
        None => println!("Test completed."),
    }
    Ok(())
}

/// Prompt for 1-based option numbers separated by whitespace and return
/// 0-based positions.
fn ask_answer(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    option_count: usize,
) -> Result<Vec<usize>, Box<dyn Error>> {
    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => return Err("input closed".into()),
        };

        let parsed: Result<Vec<usize>, _> = line
            .split_whitespace()
            .map(|token| token.parse::<usize>())
            .collect();

        match parsed {
            Ok(numbers)
                if !numbers.is_empty()
                    && numbers.iter().all(|&n| n >= 1 && n <= option_count) =>
            {
                return Ok(numbers.into_iter().map(|n| n - 1).collect());
            }
            _ => {
                println!(
                    "Enter one or more option numbers between 1 and {option_count}, separated by spaces."
                );
            }
        }
    }
}
