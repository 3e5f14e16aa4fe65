//! Server definition documents: parsing, validation and the on-disk store.
//!
//! A definition is a JSON object with `meta`, `download`, `args` and `commands`.
//! Placeholders are resolved and every step is decoded into [`Step`] once, at load time,
//! so a malformed document is rejected before anything runs.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::Value;
use steward_process::{ChannelId, PresenceKind};
use tokio::io::AsyncWriteExt;

use crate::args::{self, Args};
use crate::error::{EngineError, Result};
use crate::paths::{is_valid_definition_name, normalize_rel_path};

pub const MAIN_DIR: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EmbedColor {
    Single(String),
    Palette(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "desc")]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default, rename = "embed_color")]
    pub color: Option<EmbedColor>,
    /// `main` is the base directory under the servers root; other entries are relative to it.
    #[serde(default)]
    pub directories: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Download {
    pub link: String,
    pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    Kill,
}

/// One action of a command sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    FileCreate {
        target_dir: String,
        name: PathBuf,
        content: String,
    },
    FileExtract {
        archive: String,
        target_dir: String,
    },
    /// `kind: None` clears the status.
    Presence {
        status: String,
        kind: Option<PresenceKind>,
    },
    Shell {
        argv: Vec<String>,
    },
    ChannelBind {
        channel: ChannelId,
        role: ChannelRole,
    },
    ConsoleWrite {
        text: String,
    },
    CommandRef {
        name: String,
    },
    ChangeDirectory {
        target: String,
    },
    ProcessControl(ProcessAction),
}

#[derive(Debug, Clone)]
pub struct ServerDefinition {
    /// Key the definition was loaded under.
    pub name: String,
    pub meta: Meta,
    pub commands: BTreeMap<String, Vec<Step>>,
    pub download: Option<Download>,
    pub args: Args,
}

impl ServerDefinition {
    pub fn sequence(&self, command: &str) -> Option<&[Step]> {
        self.commands.get(command).map(Vec::as_slice)
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    pub fn display_name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or(&self.name)
    }

    /// Base directory name under the servers root.
    pub fn main_dir_name(&self) -> &str {
        self.meta
            .directories
            .get(MAIN_DIR)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
}

// Raw step shape as it appears in documents. Exactly one action key is allowed;
// `dir` only accompanies `file`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    file: Option<RawFile>,
    dir: Option<String>,
    presence: Option<RawPresence>,
    shell: Option<RawShell>,
    channel: Option<RawChannel>,
    console: Option<String>,
    command: Option<String>,
    directory: Option<String>,
    process: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    create: Option<RawCreate>,
    extract: Option<RawExtract>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCreate {
    name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExtract {
    name: String,
    #[serde(default = "main_dir_key")]
    folder: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPresence {
    #[serde(default)]
    status: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawShell {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChannel {
    id: RawChannelId,
    #[serde(default = "console_role", rename = "type")]
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChannelId {
    Number(u64),
    Text(String),
}

fn main_dir_key() -> String {
    MAIN_DIR.to_string()
}

fn console_role() -> String {
    "console".to_string()
}

fn decode_step(command: &str, index: usize, value: &Value) -> Result<Step> {
    let bad = |reason: String| EngineError::MalformedStep {
        command: command.to_string(),
        index,
        reason,
    };

    let raw = RawStep::deserialize(value).map_err(|e| bad(e.to_string()))?;
    let present = [
        raw.file.is_some(),
        raw.presence.is_some(),
        raw.shell.is_some(),
        raw.channel.is_some(),
        raw.console.is_some(),
        raw.command.is_some(),
        raw.directory.is_some(),
        raw.process.is_some(),
    ]
    .into_iter()
    .filter(|p| *p)
    .count();
    if present == 0 {
        return Err(bad("step has no action key".to_string()));
    }
    if present > 1 {
        return Err(bad("step has more than one action key".to_string()));
    }
    if raw.dir.is_some() && raw.file.is_none() {
        return Err(bad("`dir` is only valid on a `file` step".to_string()));
    }

    if let Some(file) = raw.file {
        return match (file.create, file.extract) {
            (Some(create), None) => {
                let name = normalize_rel_path(&create.name)
                    .map_err(|e| bad(format!("file name {:?}: {e}", create.name)))?;
                if name.as_os_str().is_empty() {
                    return Err(bad("file name must not be empty".to_string()));
                }
                let content = match create.data {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => serde_json::to_string_pretty(&other)
                        .map_err(|e| bad(format!("file data: {e}")))?,
                };
                Ok(Step::FileCreate {
                    target_dir: raw.dir.unwrap_or_else(main_dir_key),
                    name,
                    content,
                })
            }
            (None, Some(extract)) => Ok(Step::FileExtract {
                archive: extract.name,
                target_dir: extract.folder,
            }),
            _ => Err(bad(
                "`file` needs exactly one of `create` or `extract`".to_string(),
            )),
        };
    }

    if let Some(presence) = raw.presence {
        let kind = match presence.kind.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(k) => Some(k.parse::<PresenceKind>().map_err(bad)?),
        };
        return Ok(Step::Presence {
            status: presence.status,
            kind,
        });
    }

    if let Some(shell) = raw.shell {
        let argv = match shell {
            RawShell::Line(line) => shlex::split(&line)
                .ok_or_else(|| bad(format!("cannot tokenize shell line {line:?}")))?,
            RawShell::Argv(argv) => argv,
        };
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(bad("shell command is empty".to_string()));
        }
        return Ok(Step::Shell { argv });
    }

    if let Some(channel) = raw.channel {
        let role = match channel.role.trim().to_ascii_lowercase().as_str() {
            "console" => ChannelRole::Console,
            other => return Err(bad(format!("unsupported channel type {other:?}"))),
        };
        let id = match channel.id {
            RawChannelId::Number(n) => n.to_string(),
            RawChannelId::Text(s) if !s.trim().is_empty() => s.trim().to_string(),
            RawChannelId::Text(_) => return Err(bad("channel id is empty".to_string())),
        };
        return Ok(Step::ChannelBind {
            channel: ChannelId(id),
            role,
        });
    }

    if let Some(text) = raw.console {
        return Ok(Step::ConsoleWrite { text });
    }

    if let Some(name) = raw.command {
        if name.trim().is_empty() {
            return Err(bad("command name is empty".to_string()));
        }
        return Ok(Step::CommandRef { name });
    }

    if let Some(target) = raw.directory {
        if target.trim().is_empty() {
            return Err(bad("directory name is empty".to_string()));
        }
        return Ok(Step::ChangeDirectory { target });
    }

    match raw.process.as_deref().map(str::trim) {
        Some("kill") => Ok(Step::ProcessControl(ProcessAction::Kill)),
        Some(other) => Err(bad(format!("unsupported process action {other:?}"))),
        None => Err(bad("step has no action key".to_string())),
    }
}

/// Parses, validates and resolves a definition document.
pub fn parse_definition(name: &str, raw: &[u8]) -> Result<ServerDefinition> {
    let mut doc: Value = serde_json::from_slice(raw)
        .map_err(|e| EngineError::malformed(name, format!("invalid JSON: {e}")))?;

    {
        let Some(obj) = doc.as_object() else {
            return Err(EngineError::malformed(name, "document must be a JSON object"));
        };
        match obj.get("commands") {
            Some(Value::Object(cmds)) => {
                for (cmd, steps) in cmds {
                    let Some(steps) = steps.as_array() else {
                        return Err(EngineError::malformed(
                            name,
                            format!("command {cmd:?} must be an array of steps"),
                        ));
                    };
                    if let Some(i) = steps.iter().position(|s| !s.is_object()) {
                        return Err(EngineError::MalformedStep {
                            command: cmd.clone(),
                            index: i,
                            reason: "step must be an object".to_string(),
                        });
                    }
                }
            }
            Some(_) => return Err(EngineError::malformed(name, "`commands` must be an object")),
            None => return Err(EngineError::malformed(name, "missing `commands`")),
        }
        for key in ["meta", "download", "args"] {
            if obj.get(key).is_some_and(|v| !v.is_object()) {
                return Err(EngineError::malformed(name, format!("`{key}` must be an object")));
            }
        }
    }

    args::resolve_document(&mut doc);

    let Value::Object(mut obj) = doc else {
        return Err(EngineError::malformed(name, "document must be a JSON object"));
    };

    let meta: Meta = match obj.remove("meta") {
        Some(v) => serde_json::from_value(v)
            .map_err(|e| EngineError::malformed(name, format!("`meta`: {e}")))?,
        None => Meta::default(),
    };
    for (key, dir) in &meta.directories {
        let rel = normalize_rel_path(dir).map_err(|e| {
            EngineError::malformed(name, format!("directory {key:?} ({dir:?}): {e}"))
        })?;
        if rel.as_os_str().is_empty() {
            return Err(EngineError::malformed(
                name,
                format!("directory {key:?} must not be empty"),
            ));
        }
    }

    let download: Option<Download> = match obj.remove("download") {
        Some(v) => Some(
            serde_json::from_value(v)
                .map_err(|e| EngineError::malformed(name, format!("`download`: {e}")))?,
        ),
        None => None,
    };
    if let Some(d) = &download {
        if d.link.trim().is_empty() {
            return Err(EngineError::malformed(name, "`download.link` is empty"));
        }
        let file = normalize_rel_path(&d.file)
            .map_err(|e| EngineError::malformed(name, format!("`download.file`: {e}")))?;
        if file.as_os_str().is_empty() {
            return Err(EngineError::malformed(name, "`download.file` is empty"));
        }
    }

    let args = obj
        .get("args")
        .and_then(args::args_from_value)
        .unwrap_or_default();

    let mut commands = BTreeMap::new();
    if let Some(Value::Object(cmds)) = obj.remove("commands") {
        for (cmd, steps) in cmds {
            let steps = steps.as_array().map(Vec::as_slice).unwrap_or_default();
            let decoded = steps
                .iter()
                .enumerate()
                .map(|(i, s)| decode_step(&cmd, i, s))
                .collect::<Result<Vec<_>>>()?;
            commands.insert(cmd, decoded);
        }
    }

    Ok(ServerDefinition {
        name: name.to_string(),
        meta,
        commands,
        download,
        args,
    })
}

/// Absolute directories of one server, resolved from `meta.directories`.
#[derive(Debug, Clone)]
pub struct ServerLayout {
    main: PathBuf,
    directories: BTreeMap<String, PathBuf>,
}

impl ServerLayout {
    pub fn new(servers_root: &Path, definition: &ServerDefinition) -> Self {
        let main = servers_root.join(definition.main_dir_name());
        let directories = definition
            .meta
            .directories
            .iter()
            .filter(|(k, _)| k.as_str() != MAIN_DIR)
            .filter_map(|(k, v)| normalize_rel_path(v).ok().map(|rel| (k.clone(), main.join(rel))))
            .collect();
        Self { main, directories }
    }

    pub fn main_dir(&self) -> &Path {
        &self.main
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name == MAIN_DIR {
            return Ok(self.main.clone());
        }
        self.directories
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::DirectoryNotFound(PathBuf::from(name)))
    }
}

/// Definition documents on disk, one `<name>.json` per server.
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    dir: PathBuf,
}

impl DefinitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn definition_path(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_definition_name(name) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub async fn list_available(&self) -> Result<Vec<String>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && is_valid_definition_name(stem)
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn load(&self, name: &str) -> Result<ServerDefinition> {
        let path = self.definition_path(name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let def = parse_definition(name, &raw)?;
        tracing::debug!(
            server = name,
            commands = def.commands.len(),
            "loaded server definition"
        );
        Ok(def)
    }

    /// Adds or overwrites a definition. The document must validate before it is written.
    pub async fn replace_definition(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.definition_path(name)?;
        parse_definition(name, bytes)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        f.flush().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(server = name, path = %path.display(), "definition replaced");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<ServerDefinition> {
        parse_definition("test", v.to_string().as_bytes())
    }

    fn step_err(v: Value) -> String {
        match parse(json!({"commands": {"start": [v]}})) {
            Err(EngineError::MalformedStep { reason, .. }) => reason,
            other => panic!("expected malformed step, got {other:?}"),
        }
    }

    #[test]
    fn parses_full_document() {
        let def = parse(json!({
            "meta": {
                "name": "Vanilla",
                "desc": "survival",
                "embed_color": ["#ff0000", "#00ff00"],
                "directories": {"main": "vanilla", "world": "world"}
            },
            "download": {"link": "https://example.invalid/#ver#.zip", "file": "server.zip"},
            "args": {"ver": "1.20", "mem": "2048"},
            "commands": {
                "setup": [{"file": {"extract": {"name": "server.zip", "folder": "main"}}}],
                "start": [
                    {"shell": "java -Xmx#mem#M -jar 'server #ver#.jar' nogui"},
                    {"channel": {"id": 123456789012345678u64, "type": "console"}},
                    {"presence": {"status": "Minecraft", "type": "playing"}}
                ],
                "stop": [
                    {"console": "stop"},
                    {"presence": {"status": "", "type": null}},
                    {"process": "kill"}
                ],
                "motd": [
                    {"file": {"create": {"name": "motd.txt", "data": "hi #ver#"}}, "dir": "world"},
                    {"directory": "world"},
                    {"command": "stop"}
                ]
            }
        }))
        .unwrap();

        assert_eq!(def.display_name(), "Vanilla");
        assert_eq!(def.main_dir_name(), "vanilla");
        assert_eq!(def.meta.color, Some(EmbedColor::Palette(vec!["#ff0000".into(), "#00ff00".into()])));
        assert_eq!(def.download.as_ref().unwrap().link, "https://example.invalid/1.20.zip");
        assert_eq!(def.args.get("mem").map(String::as_str), Some("2048"));

        let start = def.sequence("start").unwrap();
        assert_eq!(
            start[0],
            Step::Shell {
                argv: vec![
                    "java".into(),
                    "-Xmx2048M".into(),
                    "-jar".into(),
                    "server 1.20.jar".into(),
                    "nogui".into()
                ]
            }
        );
        assert_eq!(
            start[1],
            Step::ChannelBind {
                channel: ChannelId("123456789012345678".into()),
                role: ChannelRole::Console
            }
        );
        assert_eq!(
            start[2],
            Step::Presence {
                status: "Minecraft".into(),
                kind: Some(PresenceKind::Playing)
            }
        );

        let stop = def.sequence("stop").unwrap();
        assert_eq!(stop[1], Step::Presence { status: String::new(), kind: None });
        assert_eq!(stop[2], Step::ProcessControl(ProcessAction::Kill));

        let motd = def.sequence("motd").unwrap();
        assert_eq!(
            motd[0],
            Step::FileCreate {
                target_dir: "world".into(),
                name: PathBuf::from("motd.txt"),
                content: "hi 1.20".into()
            }
        );
        assert_eq!(motd[2], Step::CommandRef { name: "stop".into() });
    }

    #[test]
    fn minimal_document_defaults_meta_to_definition_name() {
        let def = parse(json!({"commands": {"start": [{"shell": "echo hi"}]}})).unwrap();
        assert_eq!(def.display_name(), "test");
        assert_eq!(def.main_dir_name(), "test");
        assert!(def.download.is_none());
    }

    #[test]
    fn structured_file_data_is_written_as_json() {
        let def = parse(json!({"commands": {"init": [
            {"file": {"create": {"name": "cfg.json", "data": {"port": 7777}}}}
        ]}}))
        .unwrap();
        let Step::FileCreate { content, target_dir, .. } = &def.sequence("init").unwrap()[0] else {
            panic!("expected file create");
        };
        assert_eq!(target_dir, MAIN_DIR);
        assert_eq!(serde_json::from_str::<Value>(content).unwrap(), json!({"port": 7777}));
    }

    #[test]
    fn rejects_structural_problems() {
        assert!(matches!(
            parse(json!({"meta": {}})),
            Err(EngineError::MalformedDefinition { .. })
        ));
        assert!(matches!(
            parse(json!({"commands": {"start": "echo"}})),
            Err(EngineError::MalformedDefinition { .. })
        ));
        assert!(matches!(
            parse(json!({"commands": {}, "download": {"link": "x"}})),
            Err(EngineError::MalformedDefinition { .. })
        ));
        assert!(matches!(
            parse(json!({"commands": {}, "meta": {"directories": {"main": "../up"}}})),
            Err(EngineError::MalformedDefinition { .. })
        ));
        assert!(matches!(
            parse_definition("test", b"{not json"),
            Err(EngineError::MalformedDefinition { .. })
        ));
        assert!(matches!(
            parse(json!({"commands": {"start": [42]}})),
            Err(EngineError::MalformedStep { index: 0, .. })
        ));
    }

    #[test]
    fn rejects_malformed_steps() {
        assert!(step_err(json!({})).contains("no action key"));
        assert!(step_err(json!({"shell": "a", "console": "b"})).contains("more than one"));
        assert!(step_err(json!({"teleport": "spawn"})).contains("unknown field"));
        assert!(step_err(json!({"process": "pause"})).contains("unsupported process action"));
        assert!(step_err(json!({"channel": {"id": 1, "type": "chat"}})).contains("unsupported channel"));
        assert!(step_err(json!({"presence": {"status": "x", "type": "dancing"}})).contains("unknown presence"));
        assert!(step_err(json!({"shell": "echo 'unterminated"})).contains("cannot tokenize"));
        assert!(step_err(json!({"shell": ""})).contains("empty"));
        assert!(step_err(json!({"console": "x", "dir": "main"})).contains("`dir`"));
        assert!(step_err(json!({"file": {"create": {"name": "../x", "data": ""}}})).contains("traversal"));
        assert!(step_err(json!({"file": {}})).contains("exactly one"));
    }

    #[test]
    fn layout_resolves_named_directories() {
        let def = parse(json!({
            "meta": {"directories": {"main": "srv", "world": "data/world"}},
            "commands": {}
        }))
        .unwrap();
        let layout = ServerLayout::new(Path::new("/root/servers"), &def);
        assert_eq!(layout.main_dir(), Path::new("/root/servers/srv"));
        assert_eq!(layout.resolve("main").unwrap(), PathBuf::from("/root/servers/srv"));
        assert_eq!(
            layout.resolve("world").unwrap(),
            PathBuf::from("/root/servers/srv/data/world")
        );
        assert!(matches!(
            layout.resolve("nether"),
            Err(EngineError::DirectoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DefinitionStore::new(tmp.path().join("definitions"));

        assert!(store.list_available().await.unwrap().is_empty());
        assert!(matches!(store.load("lobby").await, Err(EngineError::NotFound(_))));
        assert!(matches!(
            store.definition_path("../etc/passwd"),
            Err(EngineError::InvalidName(_))
        ));

        let doc = json!({"commands": {"start": [{"shell": "echo hi"}]}}).to_string();
        let path = store.replace_definition("lobby", doc.as_bytes()).await.unwrap();
        assert_eq!(path, tmp.path().join("definitions").join("lobby.json"));
        store
            .replace_definition("arena", doc.as_bytes())
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("definitions").join("notes.txt"), "x")
            .await
            .unwrap();

        assert_eq!(store.list_available().await.unwrap(), vec!["arena", "lobby"]);
        let def = store.load("lobby").await.unwrap();
        assert!(def.has_command("start"));
    }

    #[tokio::test]
    async fn store_refuses_invalid_replacement() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DefinitionStore::new(tmp.path());
        let good = json!({"commands": {"start": []}}).to_string();
        store.replace_definition("lobby", good.as_bytes()).await.unwrap();

        let err = store
            .replace_definition("lobby", b"{\"commands\": 3}")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedDefinition { .. }));
        // Old document is still in place.
        assert!(store.load("lobby").await.is_ok());
    }
}
