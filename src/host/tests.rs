use super::client::{HostError, HostState, PluginClient};
use super::manifest::*;
use super::process::{pump_frames, split_interpreter, LaunchCommand};
use crate::ipc::protocol::{ContextMessage, ErrorCode, ON_INPUT_COMMAND};
use crate::ipc::transport::{encode_frame, write_frame};
use crate::ipc::{CommandContext, LogLevel, Plugin, StopReason, Transport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// -------------------------------------------------------------------------
// In-memory pipe between a host thread and a plugin thread
// -------------------------------------------------------------------------

struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    (
        PipeWriter(tx),
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

type PipePlugin = Plugin<PipeReader, PipeWriter>;

struct Harness {
    client: PluginClient<PipeWriter>,
    plugin: JoinHandle<StopReason>,
    reader: JoinHandle<()>,
}

fn start_plugin(register: impl FnOnce(&mut PipePlugin) + Send + 'static) -> Harness {
    let (host_out, plugin_in) = pipe();
    let (plugin_out, host_in) = pipe();
    let plugin = thread::spawn(move || {
        let mut plugin = Plugin::with_transport(
            "hello",
            "0.1.0",
            "in-process test plugin",
            Transport::new(plugin_in, plugin_out),
        );
        register(&mut plugin);
        plugin.run()
    });
    let (tx, rx) = unbounded();
    let reader = thread::spawn(move || pump_frames(host_in, tx, "hello"));
    Harness {
        client: PluginClient::new(host_out, rx).with_timeout(Duration::from_secs(5)),
        plugin,
        reader,
    }
}

impl Harness {
    fn finish(mut self) -> StopReason {
        self.client.shutdown().expect("shutdown");
        let reason = self.plugin.join().expect("plugin thread");
        drop(self.client);
        self.reader.join().expect("reader thread");
        reason
    }
}

fn register_demo(plugin: &mut PipePlugin) {
    plugin.command_with_description(
        "say_hello",
        "Greets someone",
        |_ctx: &mut CommandContext<'_>, args: Value| {
            let name = args.get("name").and_then(Value::as_str).unwrap_or("World");
            Ok(json!(format!("Hello, {name}!")))
        },
    );
    plugin.command("count", |ctx: &mut CommandContext<'_>, _args: Value| {
        for n in 1..=3 {
            ctx.stream(format!("{n} "));
        }
        Ok(json!("done"))
    });
    plugin.command("start_chat", |ctx: &mut CommandContext<'_>, _args: Value| {
        ctx.log(LogLevel::Info, "chat opened");
        ctx.set_keep_session(true);
        Ok(json!("Say something."))
    });
    plugin.command(ON_INPUT_COMMAND, |ctx: &mut CommandContext<'_>, args: Value| {
        let content = args["content"].as_str().unwrap_or_default().to_string();
        ctx.set_keep_session(content != "bye");
        Ok(json!(format!("echo: {content}")))
    });
    plugin.command("describe_context", |ctx: &mut CommandContext<'_>, _args: Value| {
        Ok(json!({
            "turns": ctx.context(),
            "system_info": ctx.system_info(),
        }))
    });
    plugin.command("slow", |_ctx: &mut CommandContext<'_>, _args: Value| {
        thread::sleep(Duration::from_millis(300));
        Ok(json!("finally"))
    });
}

// -------------------------------------------------------------------------
// Client
// -------------------------------------------------------------------------

#[test]
fn client_initializes_and_lists_commands() {
    let mut harness = start_plugin(register_demo);
    let info = harness.client.initialize("test-engine").expect("initialize");
    assert_eq!(info.name, "hello");
    assert_eq!(info.protocol_version, "2.0");
    let names: Vec<&str> = info.commands.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["count", "describe_context", "on_input", "say_hello", "slow", "start_chat"]
    );
    assert_eq!(info.commands[3].description, "Greets someone");
    assert_eq!(harness.finish(), StopReason::Shutdown);
}

#[test]
fn client_ping_measures_round_trip() {
    let mut harness = start_plugin(|_| {});
    let rtt = harness.client.ping(1234).expect("ping");
    assert!(rtt < Duration::from_secs(1));
    harness.finish();
}

#[test]
fn client_collects_stream_and_complete() {
    let mut harness = start_plugin(register_demo);
    let mut chunks = Vec::new();
    let response = harness
        .client
        .execute("count", json!({}), |chunk| chunks.push(chunk.to_string()))
        .expect("execute");
    assert!(response.success);
    assert_eq!(chunks, vec!["1 ", "2 ", "3 "]);
    assert_eq!(response.message, "1 2 3 done");
    assert_eq!(response.data, json!("done"));
    assert!(!response.awaiting_input);
    assert_eq!(harness.client.state(), HostState::Ready);

    let hello = harness
        .client
        .execute("say_hello", json!({ "name": "Ada" }), |_| {})
        .expect("execute");
    assert_eq!(hello.message, "Hello, Ada!");
    harness.finish();
}

#[test]
fn client_reports_unknown_command() {
    let mut harness = start_plugin(register_demo);
    let response = harness
        .client
        .execute("does_not_exist", json!({}), |_| {})
        .expect("execute");
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::MethodNotFound.code()));
    assert_eq!(response.message, "Unknown command: does_not_exist");
    harness.finish();
}

#[test]
fn client_passthrough_conversation() {
    let mut harness = start_plugin(register_demo);
    assert!(matches!(
        harness.client.send_input("too early", |_| {}),
        Err(HostError::NotAwaitingInput)
    ));

    let opened = harness
        .client
        .execute("start_chat", json!({}), |_| {})
        .expect("execute");
    assert!(opened.awaiting_input);
    assert!(harness.client.is_awaiting_input());

    let reply = harness.client.send_input("hi", |_| {}).expect("input");
    assert_eq!(reply.message, "echo: hi");
    assert!(reply.awaiting_input);

    let last = harness.client.send_input("bye", |_| {}).expect("input");
    assert_eq!(last.message, "echo: bye");
    assert!(!last.awaiting_input);
    assert_eq!(harness.client.state(), HostState::Ready);
    assert!(matches!(
        harness.client.send_input("again", |_| {}),
        Err(HostError::NotAwaitingInput)
    ));
    harness.finish();
}

#[test]
fn client_times_out_and_skips_late_results() {
    let (host_out, plugin_in) = pipe();
    let (plugin_out, host_in) = pipe();
    let plugin = thread::spawn(move || {
        let mut plugin = Plugin::with_transport(
            "hello",
            "0.1.0",
            "",
            Transport::new(plugin_in, plugin_out),
        );
        register_demo(&mut plugin);
        plugin.run()
    });
    let (tx, rx) = unbounded();
    let reader = thread::spawn(move || pump_frames(host_in, tx, "hello"));
    let mut client = PluginClient::new(host_out, rx).with_timeout(Duration::from_millis(100));

    match client.execute("slow", json!({}), |_| {}) {
        Err(HostError::Timeout { waited, .. }) => assert_eq!(waited, Duration::from_millis(100)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(client.state(), HostState::Ready);

    client.ping(1).expect("ping after timeout");
    let mut client = client.with_timeout(Duration::from_secs(5));
    let hello = client.execute("say_hello", json!({}), |_| {}).expect("execute");
    assert_eq!(hello.message, "Hello, World!");

    client.shutdown().expect("shutdown");
    assert_eq!(plugin.join().unwrap(), StopReason::Shutdown);
    drop(client);
    reader.join().unwrap();
}

#[test]
fn client_sends_context_and_system_info() {
    let mut harness = start_plugin(register_demo);
    let history = [
        ContextMessage::new("user", "what GPU do I have?"),
        ContextMessage::new("assistant", "Let me check."),
    ];
    let response = harness
        .client
        .execute_with_context(
            "describe_context",
            json!({}),
            &history,
            Some("GPU: RTX 4080"),
            |_| {},
        )
        .expect("execute with context");
    assert!(response.success);
    assert_eq!(response.data["turns"][0]["role"], "user");
    assert_eq!(response.data["turns"][1]["content"], "Let me check.");
    assert_eq!(response.data["system_info"], "GPU: RTX 4080");

    let bare = harness
        .client
        .execute("describe_context", json!({}), |_| {})
        .expect("execute without context");
    assert_eq!(bare.data, json!({ "turns": [], "system_info": null }));
    assert_eq!(harness.finish(), StopReason::Shutdown);
}

#[test]
fn client_tracks_heartbeat() {
    let (tx, rx) = unbounded();
    let mut client = PluginClient::new(Vec::new(), rx)
        .with_heartbeat(Duration::from_millis(20), Duration::from_millis(60));
    assert!(!client.needs_ping());
    assert!(!client.is_heartbeat_expired());

    thread::sleep(Duration::from_millis(80));
    assert!(client.needs_ping());
    assert!(client.is_heartbeat_expired());

    tx.send(json!({ "id": 1, "result": { "timestamp": 9 } })).unwrap();
    client.ping(9).expect("ping");
    assert!(!client.is_heartbeat_expired());
    assert!(client.heartbeat_age() < Duration::from_millis(60));
}

#[test]
fn client_refuses_work_after_shutdown() {
    let mut harness = start_plugin(register_demo);
    harness.client.shutdown().expect("shutdown");
    assert_eq!(harness.client.state(), HostState::Stopped);
    assert!(matches!(
        harness.client.execute("say_hello", json!({}), |_| {}),
        Err(HostError::Stopped)
    ));
    assert!(harness.client.shutdown().is_ok());
    assert_eq!(harness.plugin.join().unwrap(), StopReason::Shutdown);
}

#[test]
fn client_sees_disconnect() {
    let (tx, rx) = unbounded::<Value>();
    drop(tx);
    let mut client = PluginClient::new(Vec::new(), rx);
    assert!(matches!(client.ping(7), Err(HostError::Disconnected)));
}

#[test]
fn pump_skips_bad_json_and_stops_on_bad_header() {
    let mut bytes = Vec::new();
    write_frame(&mut bytes, &json!({ "method": "log" })).unwrap();
    bytes.extend(encode_frame(b"not json").unwrap());
    write_frame(&mut bytes, &json!({ "id": 2, "result": {} })).unwrap();
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    write_frame(&mut bytes, &json!({ "id": 3, "result": {} })).unwrap();

    let (tx, rx) = unbounded();
    pump_frames(Cursor::new(bytes), tx, "test");
    let received: Vec<Value> = rx.try_iter().collect();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0]["method"], "log");
    assert_eq!(received[1]["id"], 2);
}

// -------------------------------------------------------------------------
// Manifest
// -------------------------------------------------------------------------

fn plugin_dir() -> &'static Path {
    Path::new("/plugins/hello-world")
}

fn parse(manifest: Value) -> Result<PluginManifest, ManifestError> {
    PluginManifest::parse(&manifest.to_string(), plugin_dir())
}

fn base_manifest() -> Value {
    json!({
        "manifestVersion": 1,
        "executable": "hello-plugin",
        "persistent": true,
        "protocol_version": "2.0",
        "tags": ["demo", 3, "example"],
        "functions": [
            {
                "name": "say_hello",
                "description": "Greets the user",
                "tags": ["greeting"],
                "parameters": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Who to greet" },
                        "style": { "enum": ["formal", "casual"], "default": "casual" }
                    },
                    "required": ["name"]
                }
            },
            { "name": "count_with_streaming", "description": "Counts" }
        ]
    })
}

#[test]
fn parses_functions_array() {
    let manifest = parse(base_manifest()).expect("manifest");
    assert_eq!(manifest.name, "hello-world");
    assert_eq!(manifest.description, DEFAULT_DESCRIPTION);
    assert_eq!(manifest.executable_path, plugin_dir().join("hello-plugin"));
    assert!(manifest.persistent);
    assert_eq!(manifest.tags, vec!["demo", "example"]);
    assert_eq!(
        manifest.function_names(),
        vec!["say_hello", "count_with_streaming"]
    );

    let hello = manifest.function("say_hello").expect("say_hello");
    assert_eq!(hello.tags, vec!["greeting"]);
    let name = hello.parameters.iter().find(|p| p.name == "name").unwrap();
    assert!(name.required);
    assert_eq!(name.kind, "string");
    let style = hello.parameters.iter().find(|p| p.name == "style").unwrap();
    assert!(!style.required);
    assert_eq!(style.kind, "string");
    assert_eq!(
        style.enum_values,
        Some(vec!["formal".to_string(), "casual".to_string()])
    );
    assert_eq!(style.default, Some(json!("casual")));
    assert_eq!(hello.required_parameters().count(), 1);
    assert!(manifest.function("missing").is_none());
}

#[test]
fn passthrough_needs_exactly_one_function() {
    let mut raw = base_manifest();
    raw["passthrough"] = json!(true);
    assert!(!parse(raw.clone()).unwrap().passthrough);

    raw["functions"] = json!([{ "name": "chat", "description": "Talk" }]);
    assert!(parse(raw).unwrap().passthrough);
}

#[test]
fn skips_leading_bom() {
    let text = format!("\u{feff}{}", base_manifest());
    assert!(PluginManifest::parse(&text, plugin_dir()).is_ok());
}

#[test]
fn reports_missing_required_fields() {
    for field in ["manifestVersion", "executable", "persistent", "protocol_version"] {
        let mut raw = base_manifest();
        raw.as_object_mut().unwrap().remove(field);
        match parse(raw) {
            Err(ManifestError::MissingField(missing)) => assert_eq!(missing, field),
            other => panic!("expected missing {field}, got {other:?}"),
        }
    }
}

#[test]
fn rejects_unsupported_versions() {
    let mut raw = base_manifest();
    raw["protocol_version"] = json!("1.0");
    assert!(matches!(
        parse(raw),
        Err(ManifestError::UnsupportedProtocol(v)) if v == "1.0"
    ));

    let mut raw = base_manifest();
    raw["manifestVersion"] = json!(2);
    assert!(matches!(parse(raw), Err(ManifestError::UnsupportedVersion(2))));
}

#[test]
fn rejects_reserved_prefix_and_incomplete_functions() {
    let mut raw = base_manifest();
    raw["functions"] = json!([{ "name": "rise_lights", "description": "Nope" }]);
    assert!(matches!(parse(raw), Err(ManifestError::ReservedPrefix(name)) if name == "rise_lights"));

    let mut raw = base_manifest();
    raw["functions"] = json!([{ "name": "quiet" }]);
    assert!(matches!(
        parse(raw),
        Err(ManifestError::FunctionMissingDescription(name)) if name == "quiet"
    ));

    let mut raw = base_manifest();
    raw["functions"] = json!([{ "description": "Anonymous" }]);
    assert!(matches!(parse(raw), Err(ManifestError::FunctionMissingName)));

    let mut raw = base_manifest();
    raw.as_object_mut().unwrap().remove("functions");
    assert!(matches!(parse(raw), Err(ManifestError::MissingFunctions)));
}

#[test]
fn parses_schema_variants() {
    let mut raw = base_manifest();
    raw.as_object_mut().unwrap().remove("functions");
    raw["schema"] = json!({
        "anyOf": [
            { "title": "set_color", "description": "Sets a color" },
            { "function": { "name": "get_status", "description": "Reports status" } },
            { "description": "ignored: no name" }
        ]
    });
    let manifest = parse(raw).expect("anyOf manifest");
    assert_eq!(manifest.function_names(), vec!["set_color", "get_status"]);

    let mut raw = base_manifest();
    raw.as_object_mut().unwrap().remove("functions");
    raw["schema"] = json!({
        "brightness": { "description": "Adjusts brightness" },
        "$schema": "http://json-schema.org/draft-07/schema#"
    });
    let manifest = parse(raw).expect("property-map manifest");
    assert_eq!(manifest.function_names(), vec!["brightness"]);
}

#[test]
fn validates_plugin_names() {
    for good in ["hello-world", "Stock_Ticker", "a"] {
        assert!(validate_plugin_name(good).is_ok(), "{good}");
    }
    for bad in ["", "../etc", "a/b", "a\\b", "NUL", "com1", "1st", "-dash", "sp ace"] {
        assert!(validate_plugin_name(bad).is_err(), "{bad}");
    }
}

// -------------------------------------------------------------------------
// Discovery and launch
// -------------------------------------------------------------------------

fn temp_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "gassist_{tag}_{}_{nanos}_{}",
        process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn discovers_plugins_with_manifests() {
    let root = temp_dir("discover");
    for name in ["weather", "alpha", "no_manifest"] {
        fs::create_dir_all(root.join(name)).unwrap();
    }
    fs::write(root.join("weather").join(MANIFEST_FILE), "{}").unwrap();
    fs::write(root.join("alpha").join(MANIFEST_FILE), "{}").unwrap();
    fs::write(root.join("stray.json"), "{}").unwrap();

    assert_eq!(discover_plugins(&root), vec!["alpha", "weather"]);
    assert!(discover_plugins(&root.join("missing")).is_empty());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn loads_manifest_from_directory() {
    let root = temp_dir("load");
    let dir = root.join("hello-world");
    fs::create_dir_all(&dir).unwrap();
    assert!(matches!(
        PluginManifest::load_dir(&dir),
        Err(ManifestError::NotFound(_))
    ));

    fs::write(dir.join(MANIFEST_FILE), base_manifest().to_string()).unwrap();
    let manifest = PluginManifest::load_dir(&dir).expect("manifest");
    assert_eq!(manifest.name, "hello-world");
    assert_eq!(manifest.directory, dir);

    assert!(matches!(
        LaunchCommand::for_manifest(&manifest),
        Err(HostError::ExecutableNotFound(_))
    ));
    fs::write(dir.join("hello-plugin"), "").unwrap();
    let command = LaunchCommand::for_manifest(&manifest).expect("launch");
    assert_eq!(command.program, dir.join("hello-plugin").into_os_string());
    assert!(command.args.is_empty());
    assert_eq!(command.cwd.as_deref(), Some(dir.as_path()));

    let mut script = manifest.clone();
    script.executable_path = dir.join("plugin.py");
    fs::write(&script.executable_path, "").unwrap();
    let command = LaunchCommand::for_manifest(&script).expect("launch script");
    assert_eq!(
        command.args.last(),
        Some(&script.executable_path.clone().into_os_string())
    );
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn splits_interpreter_commands() {
    assert_eq!(split_interpreter("python3"), vec!["python3"]);
    assert_eq!(split_interpreter(" py -3 "), vec!["py", "-3"]);
    assert_eq!(
        split_interpreter("\"/opt/my python/bin/python\" -u"),
        vec!["/opt/my python/bin/python", "-u"]
    );
}
