use crate::automation::AutomationExecutor;
use crate::error::{BridgeError, BridgeResult};
use crate::sanitize::MAX_LABEL_CHARS;
use serde::Serialize;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const MAX_CONVERSATIONS: usize = 50;

/// What the UI shows about image generation at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GenerationProbe {
    pub generating: bool,
    pub image_count: usize,
    pub new_image_marker: bool,
}

impl GenerationProbe {
    /// Parses `generating=<bool>;images=<n>;marker=<bool>`.
    pub fn parse(raw: &str) -> BridgeResult<Self> {
        let mut probe = GenerationProbe::default();
        let mut seen = 0;
        for part in raw.trim().split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "generating" => {
                    probe.generating = value == "true";
                    seen += 1;
                }
                "images" => {
                    probe.image_count = value.parse().map_err(|_| {
                        BridgeError::Automation(format!("unreadable image count: {value}"))
                    })?;
                    seen += 1;
                }
                "marker" => probe.new_image_marker = value == "true",
                _ => {}
            }
        }
        if seen < 2 {
            return Err(BridgeError::Automation(format!(
                "unexpected probe output: {}",
                raw.trim()
            )));
        }
        Ok(probe)
    }

    /// Finished generating with at least one image on screen. The marker is
    /// only consulted when `require_marker` is set; otherwise presence is
    /// taken as the signal.
    pub fn is_complete(&self, require_marker: bool) -> bool {
        !self.generating && self.image_count > 0 && (self.new_image_marker || !require_marker)
    }
}

/// Operations against the ChatGPT desktop window. Text arguments must
/// already be sanitized for AppleScript string literals.
pub trait ChatUi: Send + Sync {
    fn ask(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<String>;
    fn list_conversations(&self, limit: usize) -> BridgeResult<Vec<String>>;
    fn trigger_generation(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<()>;
    fn probe_generation(&self) -> BridgeResult<GenerationProbe>;
    fn save_latest_image(&self, destination: &Path) -> BridgeResult<()>;
}

const SEND_SCRIPT: &str = r#"
tell application "__APP__" to activate
delay 0.5
tell application "System Events"
  if not (exists process "__APP__") then
    error "process_not_found"
  end if
  tell process "__APP__"
    if (count of windows) is 0 then
      error "no_windows"
    end if
    set frontmost to true
    set convRef to "__CONVERSATION__"
    if convRef is not "" then
      set matched to false
      repeat with el in (entire contents of window 1)
        try
          if (role of el) is "AXStaticText" and ((value of el) as text) contains convRef then
            click el
            set matched to true
            exit repeat
          end if
        end try
      end repeat
      if not matched then
        error "conversation not found: " & convRef
      end if
      delay 1
    end if
    set composer to missing value
    repeat with el in (entire contents of window 1)
      try
        if (role of el) is "AXTextArea" then
          set composer to el
        end if
      end try
    end repeat
    if composer is missing value then
      error "message composer not found"
    end if
    set focused of composer to true
    set value of composer to "__PROMPT__"
    delay 0.3
    key code 36
  end tell
end tell
return "sent"
"#;

const REPLY_PROBE_SCRIPT: &str = r#"
tell application "System Events"
  if not (exists process "__APP__") then
    error "process_not_found"
  end if
  tell process "__APP__"
    set isGenerating to false
    set lastText to ""
    repeat with el in (entire contents of window 1)
      try
        set r to role of el
        if r is "AXButton" then
          set d to (description of el) as text
          if d contains "Stop" then set isGenerating to true
        else if r is "AXStaticText" then
          set v to (value of el) as text
          if v is not "" then set lastText to v
        end if
      end try
    end repeat
    return "generating=" & isGenerating & linefeed & lastText
  end tell
end tell
"#;

const CONVERSATIONS_SCRIPT: &str = r#"
tell application "System Events"
  if not (exists process "__APP__") then
    error "process_not_found"
  end if
  tell process "__APP__"
    if (count of windows) is 0 then
      error "no_windows"
    end if
    set titles to {}
    repeat with rowRef in (rows of outline 1 of scroll area 1 of group 1 of splitter group 1 of group 1 of window 1)
      try
        set t to (value of static text 1 of UI element 1 of rowRef) as text
        if t is not "" then set end of titles to t
      end try
    end repeat
    set AppleScript's text item delimiters to linefeed
    set outText to titles as text
    set AppleScript's text item delimiters to ""
    return outText
  end tell
end tell
"#;

const GENERATION_PROBE_SCRIPT: &str = r#"
tell application "System Events"
  if not (exists process "__APP__") then
    error "process_not_found"
  end if
  tell process "__APP__"
    set isGenerating to false
    set imageCount to 0
    set hasMarker to false
    repeat with el in (entire contents of window 1)
      try
        set r to role of el
        if r is "AXImage" then
          set imageCount to imageCount + 1
        else if r is "AXButton" then
          set d to (description of el) as text
          if d contains "Stop" then set isGenerating to true
        else if r is "AXStaticText" then
          set v to (value of el) as text
          if v contains "Creating image" or v contains "Generating" then set isGenerating to true
          if v contains "Image created" or v contains "Here is" or v contains "Here's" then set hasMarker to true
        end if
      end try
    end repeat
    return "generating=" & isGenerating & ";images=" & imageCount & ";marker=" & hasMarker
  end tell
end tell
"#;

const SAVE_IMAGE_SCRIPT: &str = r#"
on run argv
  set targetDir to item 1 of argv
  set targetName to item 2 of argv
  tell application "__APP__" to activate
  delay 0.5
  tell application "System Events"
    tell process "__APP__"
      set lastImage to missing value
      repeat with el in (entire contents of window 1)
        try
          if (role of el) is "AXImage" then set lastImage to el
        end try
      end repeat
      if lastImage is missing value then
        error "no image found in conversation"
      end if
      perform action "AXShowMenu" of lastImage
      delay 0.5
      set saveItem to missing value
      repeat with itemRef in (menu items of menu 1 of lastImage)
        try
          if (name of itemRef) starts with "Save Image" then set saveItem to itemRef
        end try
      end repeat
      if saveItem is missing value then
        key code 53
        error "save image menu item not found"
      end if
      click saveItem
      delay 1
      keystroke "g" using {command down, shift down}
      delay 0.5
      keystroke targetDir
      key code 36
      delay 0.5
      set value of text field 1 of sheet 1 of window 1 to targetName
      delay 0.3
      key code 36
    end tell
  end tell
  return "saved"
end run
"#;

fn render(template: &str, app: &str, prompt: &str, conversation: &str) -> String {
    template
        .replace("__APP__", app)
        .replace("__CONVERSATION__", conversation)
        .replace("__PROMPT__", prompt)
}

/// Drives the ChatGPT desktop app through System Events.
pub struct ChatGptApp {
    executor: AutomationExecutor,
    app_name: String,
    reply_timeout: Duration,
    poll_interval: Duration,
}

impl ChatGptApp {
    pub fn new(
        executor: AutomationExecutor,
        app_name: &str,
        reply_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executor,
            app_name: app_name.replace(['"', '\\'], ""),
            reply_timeout,
            poll_interval,
        }
    }

    fn send(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<()> {
        let script = render(SEND_SCRIPT, &self.app_name, prompt, conversation.unwrap_or(""));
        self.executor.run(&script, &[])?;
        Ok(())
    }

    fn probe_reply(&self) -> BridgeResult<(bool, String)> {
        let script = render(REPLY_PROBE_SCRIPT, &self.app_name, "", "");
        let raw = self.executor.run(&script, &[])?;
        Ok(parse_reply_probe(&raw))
    }
}

fn parse_reply_probe(raw: &str) -> (bool, String) {
    let (head, body) = raw.split_once('\n').unwrap_or((raw, ""));
    let generating = head.trim() == "generating=true";
    (generating, body.trim().to_string())
}

/// Trims, de-duplicates and bounds conversation titles from the sidebar dump.
pub fn parse_conversation_titles(raw: &str, limit: usize) -> Vec<String> {
    let limit = limit.clamp(1, MAX_CONVERSATIONS);
    let mut titles: Vec<String> = Vec::new();
    for line in raw.lines() {
        let title = line.trim();
        if title.is_empty() {
            continue;
        }
        let bounded: String = title.chars().take(MAX_LABEL_CHARS).collect();
        if titles.contains(&bounded) {
            continue;
        }
        titles.push(bounded);
        if titles.len() >= limit {
            break;
        }
    }
    titles
}

impl ChatUi for ChatGptApp {
    fn ask(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<String> {
        let (_, before) = self.probe_reply().unwrap_or((false, String::new()));
        self.send(prompt, conversation)?;
        info!("prompt sent, waiting for reply");

        let deadline = Instant::now() + self.reply_timeout;
        let mut previous: Option<String> = None;
        while Instant::now() < deadline {
            thread::sleep(self.poll_interval);
            let (generating, reply) = match self.probe_reply() {
                Ok(state) => state,
                Err(err) => {
                    debug!(error = %err.public_message(), "reply probe failed");
                    continue;
                }
            };
            if generating || reply.is_empty() || reply == before {
                previous = None;
                continue;
            }
            if previous.as_deref() == Some(reply.as_str()) {
                return Ok(reply);
            }
            previous = Some(reply);
        }
        Err(BridgeError::Automation(format!(
            "no reply within {}s",
            self.reply_timeout.as_secs()
        )))
    }

    fn list_conversations(&self, limit: usize) -> BridgeResult<Vec<String>> {
        let script = render(CONVERSATIONS_SCRIPT, &self.app_name, "", "");
        let raw = self.executor.run(&script, &[])?;
        Ok(parse_conversation_titles(&raw, limit))
    }

    fn trigger_generation(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<()> {
        self.send(prompt, conversation)
    }

    fn probe_generation(&self) -> BridgeResult<GenerationProbe> {
        let script = render(GENERATION_PROBE_SCRIPT, &self.app_name, "", "");
        let raw = self.executor.run(&script, &[])?;
        GenerationProbe::parse(&raw)
    }

    fn save_latest_image(&self, destination: &Path) -> BridgeResult<()> {
        let dir = destination
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BridgeError::InvalidFilename(destination.display().to_string()))?
            .to_string();
        let script = render(SAVE_IMAGE_SCRIPT, &self.app_name, "", "");
        self.executor.run(&script, &[dir, name])?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ChatUi, GenerationProbe};
    use crate::error::{BridgeError, BridgeResult};
    use image::{ImageFormat, RgbImage};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::Receiver;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SaveMode {
        Png,
        Empty,
        Garbage,
        Nothing,
        Fail,
    }

    /// In-memory stand-in for the desktop app.
    pub struct FakeChatUi {
        pub probe: Mutex<Result<GenerationProbe, String>>,
        pub trigger_error: Mutex<Option<String>>,
        /// When set, `trigger_generation` blocks until a message arrives.
        pub trigger_gate: Mutex<Option<Receiver<()>>>,
        pub reply: Mutex<String>,
        pub conversations: Mutex<Vec<String>>,
        pub save_mode: Mutex<SaveMode>,
        pub triggered: Mutex<Vec<(String, Option<String>)>>,
        pub asked: Mutex<Vec<String>>,
        pub saved: Mutex<Vec<PathBuf>>,
        pub probes: Mutex<usize>,
    }

    impl FakeChatUi {
        pub fn new() -> Self {
            Self {
                probe: Mutex::new(Ok(GenerationProbe {
                    generating: true,
                    image_count: 0,
                    new_image_marker: false,
                })),
                trigger_error: Mutex::new(None),
                trigger_gate: Mutex::new(None),
                reply: Mutex::new("pong".to_string()),
                conversations: Mutex::new(vec!["Trip ideas".to_string()]),
                save_mode: Mutex::new(SaveMode::Png),
                triggered: Mutex::new(Vec::new()),
                asked: Mutex::new(Vec::new()),
                saved: Mutex::new(Vec::new()),
                probes: Mutex::new(0),
            }
        }

        pub fn set_probe(&self, generating: bool, image_count: usize) {
            *self.probe.lock().unwrap() = Ok(GenerationProbe {
                generating,
                image_count,
                new_image_marker: false,
            });
        }

        pub fn fail_probe(&self, message: &str) {
            *self.probe.lock().unwrap() = Err(message.to_string());
        }

        pub fn fail_trigger(&self, message: &str) {
            *self.trigger_error.lock().unwrap() = Some(message.to_string());
        }

        pub fn set_save_mode(&self, mode: SaveMode) {
            *self.save_mode.lock().unwrap() = mode;
        }
    }

    impl ChatUi for FakeChatUi {
        fn ask(&self, prompt: &str, _conversation: Option<&str>) -> BridgeResult<String> {
            self.asked.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.lock().unwrap().clone())
        }

        fn list_conversations(&self, limit: usize) -> BridgeResult<Vec<String>> {
            Ok(self
                .conversations
                .lock()
                .unwrap()
                .iter()
                .take(limit)
                .cloned()
                .collect())
        }

        fn trigger_generation(&self, prompt: &str, conversation: Option<&str>) -> BridgeResult<()> {
            let gate = self.trigger_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            self.triggered
                .lock()
                .unwrap()
                .push((prompt.to_string(), conversation.map(str::to_string)));
            match self.trigger_error.lock().unwrap().clone() {
                Some(message) => Err(BridgeError::Automation(message)),
                None => Ok(()),
            }
        }

        fn probe_generation(&self) -> BridgeResult<GenerationProbe> {
            *self.probes.lock().unwrap() += 1;
            self.probe
                .lock()
                .unwrap()
                .clone()
                .map_err(BridgeError::Automation)
        }

        fn save_latest_image(&self, destination: &Path) -> BridgeResult<()> {
            self.saved.lock().unwrap().push(destination.to_path_buf());
            match *self.save_mode.lock().unwrap() {
                SaveMode::Png => {
                    RgbImage::new(4, 3)
                        .save_with_format(destination, ImageFormat::Png)
                        .map_err(|e| BridgeError::Automation(e.to_string()))?;
                }
                SaveMode::Empty => fs::write(destination, b"")?,
                SaveMode::Garbage => fs::write(destination, b"definitely not an image")?,
                SaveMode::Nothing => {}
                SaveMode::Fail => {
                    return Err(BridgeError::Automation(
                        "no image found in conversation".to_string(),
                    ))
                }
            }
            Ok(())
        }
    }
}
