//! Key injection and app launching on the device
//!
//! `press` writes raw evdev events straight into the kernel input queue.
//! `press_input` and `open_app` go through the platform launchers instead:
//! a chain of candidate commands is tried in order and the first one whose
//! binary can be spawned decides the outcome.

use crate::error::{Result, RmiError};
use log::{debug, warn};
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;

/// Kernel input device commands are injected into
const EVENT_DEVICE: &str = "/dev/input/event2";

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const SYN_REPORT: u16 = 0;

/// Highest keycode the kernel input layer accepts (KEY_MAX)
const KEYCODE_MAX: i32 = 0x2ff;

/// uid/gid of the platform shell user
const SHELL_ID: u32 = 2000;

/// Environment the platform launchers expect
const SHELL_ENV: &[(&str, &str)] = &[
    ("PATH", "/sbin:/vendor/bin:/system/sbin:/system/bin:/system/xbin"),
    ("ANDROID_ROOT", "/system"),
    ("ANDROID_DATA", "/data"),
    ("ANDROID_RUNTIME_ROOT", "/system"),
    ("ANDROID_ASSETS", "/system/app"),
    ("ANDROID_BOOTLOGO", "1"),
    ("ANDROID_STORAGE", "/storage"),
    ("EXTERNAL_STORAGE", "/sdcard"),
    ("ASEC_MOUNTPOINT", "/mnt/asec"),
    ("TMPDIR", "/data/local/tmp"),
    ("HOME", "/data"),
    ("USER", "shell"),
    ("SHELL", "/system/bin/sh"),
    ("MKSH", "/system/bin/sh"),
    ("TERM", "xterm"),
    (
        "BOOTCLASSPATH",
        "/system/framework/core-libart.jar:/system/framework/conscrypt.jar\
         :/system/framework/okhttp.jar:/system/framework/core-junit.jar\
         :/system/framework/bouncycastle.jar:/system/framework/ext.jar\
         :/system/framework/framework.jar:/system/framework/telephony-common.jar\
         :/system/framework/voip-common.jar:/system/framework/ims-common.jar\
         :/system/framework/apache-xml.jar:/system/framework/org.apache.http.legacy.boot.jar",
    ),
    (
        "SYSTEMSERVERCLASSPATH",
        "/system/framework/services.jar:/system/framework/ethernet-service.jar\
         :/system/framework/wifi-service.jar",
    ),
    (
        "LD_LIBRARY_PATH",
        "/system/lib64:/vendor/lib64:/system/lib:/vendor/lib",
    ),
];

/// One candidate command of a launcher fallback chain
struct Launcher {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    drop_privileges: bool,
}

impl Launcher {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: Vec::new(),
            drop_privileges: false,
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    fn as_shell_user(mut self) -> Self {
        self.drop_privileges = true;
        self
    }
}

/// Inject a low-level key press directly into the kernel input queue
pub fn press(keycode: i32) -> Result<()> {
    if !(0..=KEYCODE_MAX).contains(&keycode) {
        return Err(RmiError::Protocol(format!(
            "keycode {} out of range",
            keycode
        )));
    }
    let events = key_event_batch(keycode as u16);
    let mut device = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(EVENT_DEVICE)?;
    device.write_all(event_bytes(&events))?;
    debug!("injected keycode {} via {}", keycode, EVENT_DEVICE);
    Ok(())
}

/// Inject a key press through the platform input command, falling back
/// across the launchers available on the device
pub async fn press_input(keycode: i32) -> Result<()> {
    if keycode < 0 {
        return Err(RmiError::Protocol(format!(
            "keycode {} out of range",
            keycode
        )));
    }
    let key = keycode.to_string();
    let classpath = "/system/framework/input.jar";
    let app_process_args: &[&str] =
        &["/system/bin", "com.android.commands.input.Input", "keyevent", &key];
    run_first_available(vec![
        Launcher::new(
            "/system/bin/runcon",
            &["u:r:shell:s0", "/system/bin/sh", "/system/bin/input", "keyevent", &key],
        ),
        Launcher::new("/system/bin/sh", &["/system/bin/input", "keyevent", &key])
            .as_shell_user(),
        Launcher::new("/system/bin/app_process", app_process_args)
            .with_env("CLASSPATH", classpath)
            .as_shell_user(),
        Launcher::new("/system/bin/app_process64", app_process_args)
            .with_env("CLASSPATH", classpath)
            .as_shell_user(),
        Launcher::new("/system/bin/app_process32", app_process_args)
            .with_env("CLASSPATH", classpath)
            .as_shell_user(),
        Launcher::new("/system/bin/cmd", &["input", "keyevent", &key]).as_shell_user(),
        Launcher::new("/system/bin/toybox", &["input", "keyevent", &key]).as_shell_user(),
        Launcher::new("/system/bin/toolbox", &["input", "keyevent", &key]).as_shell_user(),
    ])
    .await
}

/// Launch an app by component or package name
pub async fn open_app(target: &str) -> Result<()> {
    run_first_available(vec![
        Launcher::new("/system/bin/sh", &["/system/bin/am", "start", "-n", target])
            .as_shell_user(),
        Launcher::new("/system/bin/cmd", &["activity", "start-activity", target])
            .as_shell_user(),
        Launcher::new(
            "/system/bin/monkey",
            &["-p", target, "-c", "android.intent.category.LAUNCHER", "1"],
        )
        .as_shell_user(),
    ])
    .await
}

/// Run the first candidate whose binary spawns; its exit status decides.
/// Spawn failures fall through to the next candidate.
async fn run_first_available(candidates: Vec<Launcher>) -> Result<()> {
    for candidate in candidates {
        let mut command = Command::new(&candidate.program);
        command
            .args(&candidate.args)
            .envs(SHELL_ENV.iter().copied())
            .envs(candidate.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if candidate.drop_privileges && unsafe { libc::geteuid() } == 0 {
            command.uid(SHELL_ID).gid(SHELL_ID);
        }
        match command.status().await {
            Ok(status) if status.success() => {
                debug!("{} succeeded", candidate.program);
                return Ok(());
            }
            Ok(status) => {
                warn!("{} exited with {}", candidate.program, status);
                return Err(RmiError::Io(std::io::Error::other(format!(
                    "launcher exited with {}",
                    status
                ))));
            }
            Err(err) => {
                debug!("{} unavailable: {}", candidate.program, err);
                continue;
            }
        }
    }
    Err(RmiError::Io(std::io::Error::other("no launcher available")))
}

fn key_event_batch(code: u16) -> [libc::input_event; 4] {
    let mut time = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe { libc::gettimeofday(&mut time, std::ptr::null_mut()) };
    let event = |type_: u16, code: u16, value: i32| libc::input_event {
        time,
        type_,
        code,
        value,
    };
    [
        event(EV_KEY, code, 1),
        event(EV_SYN, SYN_REPORT, 0),
        event(EV_KEY, code, 0),
        event(EV_SYN, SYN_REPORT, 0),
    ]
}

fn event_bytes(events: &[libc::input_event]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            events.as_ptr().cast::<u8>(),
            std::mem::size_of_val(events),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_event_batch_is_press_syn_release_syn() {
        let events = key_event_batch(24);
        assert_eq!(events[0].type_, EV_KEY);
        assert_eq!(events[0].code, 24);
        assert_eq!(events[0].value, 1);
        assert_eq!(events[1].type_, EV_SYN);
        assert_eq!(events[1].value, 0);
        assert_eq!(events[2].type_, EV_KEY);
        assert_eq!(events[2].code, 24);
        assert_eq!(events[2].value, 0);
        assert_eq!(events[3].type_, EV_SYN);
    }

    #[test]
    fn event_bytes_covers_the_whole_batch() {
        let events = key_event_batch(1);
        assert_eq!(
            event_bytes(&events).len(),
            4 * std::mem::size_of::<libc::input_event>()
        );
    }

    #[test]
    fn press_rejects_out_of_range_keycodes() {
        assert!(press(-1).is_err());
        assert!(press(KEYCODE_MAX + 1).is_err());
    }

    #[tokio::test]
    async fn launcher_chain_skips_missing_binaries() {
        let result = run_first_available(vec![
            Launcher::new("/nonexistent/launcher", &["keyevent"]),
            Launcher::new("/bin/sh", &["-c", "exit 0"]),
        ])
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn first_spawnable_launcher_decides() {
        let result = run_first_available(vec![
            Launcher::new("/bin/sh", &["-c", "exit 1"]),
            Launcher::new("/bin/sh", &["-c", "exit 0"]),
        ])
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        assert!(run_first_available(Vec::new()).await.is_err());
    }
}
