// outpost: Twilio SMS and voice hooks - TwiML rendering and DTMF decoding

use crate::error::OutpostError;
use crate::httpd::HttpState;
use crate::pipeline::Command;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use rand::Rng;
use serde::Deserialize;

/// Upper bound on command execution for the Twilio hooks; phone calls do not
/// wait around for long commands.
pub const TWILIO_COMMAND_TIMEOUT_SEC: u64 = 30;

/// Spoken when a phone command produced no output
pub const EMPTY_OUTPUT_SPEECH: &str = "EMPTY OUTPUT";

/// A per-process random path keeps opportunistic POSTs away from the call
/// callback; the PIN still guards command execution.
pub fn random_callback_path() -> String {
    format!("/call-{:016x}", rand::thread_rng().gen::<u64>())
}

pub fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn twiml_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn gather_twiml(action: &str, say: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20   <Gather action=\"{}\" method=\"POST\" timeout=\"30\" finishOnKey=\"#\" numDigits=\"1000\">\n\
         \x20       <Say>{}</Say>\n\
         \x20   </Gather>\n\
         </Response>\n",
        action, say
    )
}

fn sorry_twiml() -> String {
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
     <Response>\n\
     \t<Say>Sorry</Say>\n\
     \t<Hangup/>\n\
     </Response>\n"
        .to_string()
}

#[derive(Deserialize)]
pub struct SmsHookSubmission {
    #[serde(rename = "Body", default)]
    pub body: String,
}

/// SMS webhook: the message text is the command. A PIN mismatch is answered
/// with 404 so that probes learn nothing.
pub async fn handle_sms_hook(
    State(state): State<HttpState>,
    Form(submission): Form<SmsHookSubmission>,
) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let (_, result) = pipeline
        .transform(Command::new(
            submission.body,
            TWILIO_COMMAND_TIMEOUT_SEC,
            "httpd",
        ))
        .await;
    if result.error == Some(OutpostError::PinAndShortcutNotFound) {
        return StatusCode::NOT_FOUND.into_response();
    }
    twiml_response(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response><Message>{}</Message></Response>\n",
        xml_escape(&result.combined_text)
    ))
}

/// Call webhook: greet the caller and gather number-pad input for the
/// randomised callback endpoint.
pub async fn handle_call_hook(State(state): State<HttpState>) -> Response {
    let greeting = xml_escape(&state.handlers.twilio_call_endpoint_config.call_greeting);
    twiml_response(gather_twiml(&state.twilio_callback_path, &greeting))
}

#[derive(Deserialize)]
pub struct CallCallbackSubmission {
    #[serde(rename = "Digits", default)]
    pub digits: String,
}

/// Call callback: decode the DTMF digits into a command, run it, and speak
/// the output three times.
pub async fn handle_call_callback(
    State(state): State<HttpState>,
    Form(submission): Form<CallCallbackSubmission>,
) -> Response {
    let decoded = match dtmf_decode(&submission.digits) {
        Some(decoded) if !decoded.trim().is_empty() => decoded.trim().to_string(),
        _ => return twiml_response(sorry_twiml()),
    };
    let Some(pipeline) = &state.pipeline else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let (_, result) = pipeline
        .transform(Command::new(decoded, TWILIO_COMMAND_TIMEOUT_SEC, "httpd"))
        .await;
    let mut spoken = result.combined_text;
    if spoken.is_empty() {
        spoken = EMPTY_OUTPUT_SPEECH.to_string();
    }
    let repeated = format!("{0}, repeat again, {0}, repeat again, {0}, over.", spoken);
    twiml_response(gather_twiml(
        &state.twilio_callback_path,
        &xml_escape(&repeated),
    ))
}

// Number-pad alphabet. Row 1 carries punctuation, rows 2-9 the usual
// letters; 0 separates letter groups and a doubled 0 produces a space.
const DTMF_ROWS: [&str; 9] = [
    "./-_!@#$%&", // 1
    "abc",        // 2
    "def",        // 3
    "ghi",        // 4
    "jkl",        // 5
    "mno",        // 6
    "pqrs",       // 7
    "tuv",        // 8
    "wxyz",       // 9
];

/// Decode number-pad input into a command string. Returns None on any digit
/// sequence outside the phonebook.
pub fn dtmf_decode(digits: &str) -> Option<String> {
    if digits.chars().any(|c| !c.is_ascii_digit()) {
        return None;
    }
    let mut decoded = String::new();
    for token in digits.split('0') {
        if token.is_empty() {
            decoded.push(' ');
            continue;
        }
        let mut chars = token.chars().peekable();
        while let Some(digit) = chars.next() {
            let mut run = 1usize;
            while chars.peek() == Some(&digit) {
                chars.next();
                run += 1;
            }
            let row = DTMF_ROWS[(digit as usize) - ('1' as usize)];
            let letter = row.chars().nth(run - 1)?;
            decoded.push(letter);
        }
    }
    // The first split token is only empty when the input starts with 0
    Some(decoded.trim_start().to_string())
}
