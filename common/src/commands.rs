//! Debug command dispatcher.
//!
//! The same command strings arrive from the serial console, the MQTT command
//! topic or a remote debug session. The dispatcher mutates its own flags and
//! trace level, collects response lines, and returns side effects (restart,
//! level changes) for the platform layer to execute. Device-specific report
//! lines come in through provider hooks so this stays unit testable.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceLevel::None => "None",
            TraceLevel::Error => "Error",
            TraceLevel::Warn => "Warning",
            TraceLevel::Info => "Info",
            TraceLevel::Debug => "Debug",
            TraceLevel::Verbose => "Verbose",
        };
        f.write_str(name)
    }
}

/// Where a command came from. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Serial,
    Mqtt,
    Console,
}

/// Side effects the platform layer must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEffect {
    Restart,
    TraceLevelChanged(TraceLevel),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    pub effects: Vec<CommandEffect>,
}

impl CommandOutput {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

/// Runtime toggles shared with the rest of the firmware.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFlags {
    pub debug: bool,
    pub trace: bool,
    pub watchdog: bool,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            debug: false,
            trace: false,
            watchdog: true,
        }
    }
}

type LinesProvider = Box<dyn Fn() -> Vec<String> + Send>;
type TextProvider = Box<dyn Fn() -> String + Send>;
type FallbackHook = Box<dyn Fn(&str) -> Option<Vec<String>> + Send>;

pub struct CommandDispatcher {
    flags: RuntimeFlags,
    trace_level: TraceLevel,
    saved_level: TraceLevel,
    vars_provider: Option<LinesProvider>,
    user_provider: Option<LinesProvider>,
    heap_provider: Option<TextProvider>,
    help_hook: Option<TextProvider>,
    fallback_hook: Option<FallbackHook>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            flags: RuntimeFlags::default(),
            trace_level: TraceLevel::Info,
            saved_level: TraceLevel::Info,
            vars_provider: None,
            user_provider: None,
            heap_provider: None,
            help_hook: None,
            fallback_hook: None,
        }
    }

    pub fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace_level
    }

    /// Device report lines for `vars` (version, uptime, IP, MQTT config).
    pub fn set_vars_provider(&mut self, provider: impl Fn() -> Vec<String> + Send + 'static) {
        self.vars_provider = Some(Box::new(provider));
    }

    /// User config dump lines for `user`.
    pub fn set_user_provider(&mut self, provider: impl Fn() -> Vec<String> + Send + 'static) {
        self.user_provider = Some(Box::new(provider));
    }

    pub fn set_heap_provider(&mut self, provider: impl Fn() -> String + Send + 'static) {
        self.heap_provider = Some(Box::new(provider));
    }

    /// Extra help text appended to the built-in help.
    pub fn set_help_hook(&mut self, hook: impl Fn() -> String + Send + 'static) {
        self.help_hook = Some(Box::new(hook));
    }

    /// Called with commands no built-in matched. `Some` means handled.
    pub fn set_fallback_hook(
        &mut self,
        hook: impl Fn(&str) -> Option<Vec<String>> + Send + 'static,
    ) {
        self.fallback_hook = Some(Box::new(hook));
    }

    pub fn execute(&mut self, command: &str) -> CommandOutput {
        let mut out = CommandOutput::default();
        match command.trim() {
            "vars" => {
                if let Some(provider) = &self.vars_provider {
                    out.lines.extend(provider());
                }
            }
            "user" => {
                if let Some(provider) = &self.user_provider {
                    out.lines.extend(provider());
                }
            }
            "debug" => {
                self.flags.debug = !self.flags.debug;
                out.line(format!("Debug is now {}", self.flags.debug as u8));
            }
            "trace" => {
                self.flags.trace = !self.flags.trace;
                out.line(format!("Trace is now {}", self.flags.trace as u8));
            }
            "wdt" => {
                self.flags.watchdog = !self.flags.watchdog;
                out.line(format!("Watchdog is now {}", self.flags.watchdog as u8));
            }
            "h" | "?" | "help" => {
                out.line("help -> display this message");
                out.line("m -> display memory available");
                out.line("v -> set debug level to verbose");
                out.line("d -> set debug level to debug");
                out.line("i -> set debug level to info");
                out.line("w -> set debug level to warning");
                out.line("e -> set debug level to errors");
                out.line("s -> set debug silence on/off");
                out.line("vars -> dump standard variables");
                out.line("user -> dump user variables");
                out.line("debug -> toggle debug flag");
                out.line("trace -> toggle trace flag");
                out.line("wdt -> toggle watchdog flag");
                out.line("reset -> restart the device");
                if let Some(hook) = &self.help_hook {
                    let extra = hook();
                    if !extra.is_empty() {
                        out.line(extra);
                    }
                }
            }
            "m" => {
                if let Some(provider) = &self.heap_provider {
                    out.line(format!("Free Heap RAM: {}", provider()));
                }
            }
            "v" => self.set_level(TraceLevel::Verbose, &mut out),
            "d" => self.set_level(TraceLevel::Debug, &mut out),
            "i" => self.set_level(TraceLevel::Info, &mut out),
            "w" => self.set_level(TraceLevel::Warn, &mut out),
            "e" => self.set_level(TraceLevel::Error, &mut out),
            "s" => {
                if self.trace_level != TraceLevel::None {
                    out.line("Silence on");
                    self.saved_level = self.trace_level;
                    self.trace_level = TraceLevel::None;
                } else {
                    self.trace_level = self.saved_level;
                    out.line(format!(
                        "Silence off, level restored to {}",
                        self.trace_level
                    ));
                }
                out.effects
                    .push(CommandEffect::TraceLevelChanged(self.trace_level));
            }
            "reset" => {
                out.line("Restarting ...");
                out.effects.push(CommandEffect::Restart);
            }
            other => {
                if let Some(hook) = &self.fallback_hook {
                    if let Some(lines) = hook(other) {
                        out.lines.extend(lines);
                        return out;
                    }
                }
                out.line(format!("Unknown command: {other}"));
            }
        }
        out
    }

    fn set_level(&mut self, level: TraceLevel, out: &mut CommandOutput) {
        self.trace_level = level;
        out.line(format!("Trace level set to {level}"));
        out.effects.push(CommandEffect::TraceLevelChanged(level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flag_toggles_report_their_new_state() {
        let mut dispatcher = CommandDispatcher::new();
        assert_eq!(
            dispatcher.execute("debug").lines,
            vec!["Debug is now 1".to_string()]
        );
        assert_eq!(
            dispatcher.execute("debug").lines,
            vec!["Debug is now 0".to_string()]
        );
        assert_eq!(
            dispatcher.execute("wdt").lines,
            vec!["Watchdog is now 0".to_string()]
        );
    }

    #[test]
    fn silence_restores_the_previous_level() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.execute("v");
        assert_eq!(dispatcher.trace_level(), TraceLevel::Verbose);

        let out = dispatcher.execute("s");
        assert_eq!(dispatcher.trace_level(), TraceLevel::None);
        assert_eq!(
            out.effects,
            vec![CommandEffect::TraceLevelChanged(TraceLevel::None)]
        );

        let out = dispatcher.execute("s");
        assert_eq!(dispatcher.trace_level(), TraceLevel::Verbose);
        assert_eq!(
            out.lines,
            vec!["Silence off, level restored to Verbose".to_string()]
        );
    }

    #[test]
    fn reset_emits_a_restart_effect() {
        let mut dispatcher = CommandDispatcher::new();
        let out = dispatcher.execute("reset");
        assert_eq!(out.effects, vec![CommandEffect::Restart]);
    }

    #[test]
    fn help_appends_the_user_hook_text() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.set_help_hook(|| "mycmd -> do the thing".to_string());
        let out = dispatcher.execute("help");
        assert_eq!(out.lines.last().unwrap(), "mycmd -> do the thing");
    }

    #[test]
    fn unknown_commands_go_to_the_fallback() {
        let mut dispatcher = CommandDispatcher::new();
        let out = dispatcher.execute("frobnicate");
        assert_eq!(out.lines, vec!["Unknown command: frobnicate".to_string()]);

        dispatcher.set_fallback_hook(|cmd| {
            (cmd == "frobnicate").then(|| vec!["frobnicated".to_string()])
        });
        let out = dispatcher.execute("frobnicate");
        assert_eq!(out.lines, vec!["frobnicated".to_string()]);
    }

    #[test]
    fn vars_uses_the_provider() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.set_vars_provider(|| vec!["version=1.0/0.1.0".to_string()]);
        let out = dispatcher.execute("vars");
        assert_eq!(out.lines, vec!["version=1.0/0.1.0".to_string()]);
    }
}
