//! Provisioning run
//!
//! Drives one peer through `AwaitingName -> Validating -> Generating ->
//! Writing -> Rendering -> Done`. Any error ends the run in `Failed`; the
//! returned [`RunError`] carries the stage that failed and every side effect
//! already performed. Nothing is retried or rolled back.
//!
//! All checks that can fail without touching the filesystem run in
//! `Validating`, including locking and parsing the server configuration.
//! The lock is held until the new stanza has been appended.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::Ipv4Net;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Settings;
use crate::error::{Artifact, ProvisionError, Result, RunError, Stage};
use crate::keys::{KeyGenerator, NativeKeyGenerator, PeerKeys, WgKeyGenerator};
use crate::output::{self, PeerPaths};
use crate::qr::{self, QrEmitter, QrencodeEmitter};
use crate::render::{self, Peer, PeerName, ServerMetadata};
use crate::server::{self, ServerConfigFile};
use crate::tool::ToolCommand;

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub name: PeerName,
    pub public_key: String,
    pub allowed_ip: Ipv4Net,
    pub paths: PeerPaths,
    pub server_config: PathBuf,
    pub client_config: String,
}

/// Orchestrates key generation, rendering, writing and QR output for one peer
pub struct Provisioner {
    settings: Settings,
    server: ServerConfigFile,
    keygen: Box<dyn KeyGenerator>,
    qr: Box<dyn QrEmitter>,
    wg: ToolCommand,
}

/// Stage tracking for a single run
struct Run {
    stage: Stage,
    completed: Vec<Artifact>,
}

impl Run {
    fn new() -> Self {
        Self {
            stage: Stage::AwaitingName,
            completed: Vec::new(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    fn record(&mut self, artifact: Artifact) {
        self.completed.push(artifact);
    }

    fn fail(self, source: ProvisionError) -> RunError {
        tracing::debug!("{:?} -> {:?}", self.stage, Stage::Failed);
        RunError {
            stage: self.stage,
            completed: self.completed,
            source,
        }
    }
}

impl Provisioner {
    /// Wire up the real collaborators described by `settings`
    pub fn from_settings(settings: Settings) -> Self {
        let timeout = settings.tool_timeout();
        let wg = ToolCommand::new(settings.wg_command.clone());
        let keygen: Box<dyn KeyGenerator> = if settings.native_keys {
            Box::new(NativeKeyGenerator)
        } else {
            Box::new(WgKeyGenerator::new(wg.clone(), timeout))
        };
        let qr = Box::new(QrencodeEmitter::new(
            ToolCommand::new(settings.qrencode_command.clone()),
            timeout,
        ));
        Self::new(settings, keygen, qr, wg)
    }

    pub fn new(
        settings: Settings,
        keygen: Box<dyn KeyGenerator>,
        qr: Box<dyn QrEmitter>,
        wg: ToolCommand,
    ) -> Self {
        let server = ServerConfigFile::new(settings.server_config.clone());
        Self {
            settings,
            server,
            keygen,
            qr,
            wg,
        }
    }

    /// Prompt for the peer name on `input`/`prompt`, then provision it
    pub async fn run<R, W>(&self, input: R, mut prompt: W) -> std::result::Result<Provisioned, RunError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let run = Run::new();
        let name = match read_name(input, &mut prompt).await {
            Ok(name) => name,
            Err(e) => return Err(run.fail(e)),
        };
        self.provision_with(run, &name).await
    }

    /// Provision a peer named `raw_name`
    pub async fn provision(&self, raw_name: &str) -> std::result::Result<Provisioned, RunError> {
        self.provision_with(Run::new(), raw_name).await
    }

    async fn provision_with(
        &self,
        mut run: Run,
        raw_name: &str,
    ) -> std::result::Result<Provisioned, RunError> {
        match self.steps(&mut run, raw_name).await {
            Ok(done) => {
                run.enter(Stage::Done);
                tracing::info!(
                    "Provisioned peer {} at {} ({})",
                    done.name,
                    done.allowed_ip,
                    done.paths.dir.display()
                );
                Ok(done)
            }
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn steps(&self, run: &mut Run, raw_name: &str) -> Result<Provisioned> {
        let settings = &self.settings;

        run.enter(Stage::Validating);
        let name = PeerName::parse(raw_name)?;
        settings.validate()?;
        self.server.check_access()?;
        output::check_output_dir(&settings.output_dir)?;

        let paths = PeerPaths::new(&settings.output_dir, &name);
        output::ensure_absent(&paths)?;

        if !settings.native_keys || settings.apply {
            self.wg.ensure_available()?;
        }
        self.qr.preflight()?;

        let lock = self.server.lock(settings.lock_timeout()).await?;
        let snapshot = lock.read()?;
        if snapshot.config.peer_named(name.as_str()).is_some() {
            return Err(ProvisionError::AlreadyExists {
                what: format!(
                    "a peer named '{}' is already in {}",
                    name,
                    lock.path().display()
                ),
            });
        }

        let allowed_ip = server::next_free_address(&snapshot.config)?;
        let metadata = ServerMetadata {
            public_key: BASE64.encode(snapshot.config.public_key()),
            endpoint: settings.resolve_endpoint(snapshot.config.interface.listen_port)?,
            dns: settings.dns.clone(),
            client_allowed_ips: settings.client_allowed_ips.clone(),
            persistent_keepalive: settings.persistent_keepalive,
        };
        tracing::info!("Assigning {} to peer {}", allowed_ip, name);

        run.enter(Stage::Generating);
        let keys = self.keygen.generate(settings.preshared_key).await?;
        if snapshot
            .config
            .peers
            .iter()
            .any(|p| BASE64.encode(p.public_key) == keys.public_key)
        {
            return Err(ProvisionError::AlreadyExists {
                what: format!("public key {} is already configured", keys.public_key),
            });
        }

        let peer = Peer {
            name,
            keys,
            allowed_ip,
        };
        let client_config = render::client_config(&peer, &metadata);
        let stanza = render::server_stanza(&peer);
        qr::check_capacity(&client_config)?;

        run.enter(Stage::Writing);
        output::create_peer_directory(&paths)?;
        run.record(Artifact::PeerDirectory(paths.dir.clone()));

        output::write_client_config(&paths.config, &client_config)?;
        run.record(Artifact::ClientConfig(paths.config.clone()));

        lock.append_peer_stanza(&snapshot, &stanza)?;
        run.record(Artifact::ServerStanza(lock.path().to_path_buf()));
        drop(lock);

        if settings.apply {
            let interface = self.apply_live(&peer.keys, peer.allowed_ip).await?;
            run.record(Artifact::LivePeer(interface));
        }

        run.enter(Stage::Rendering);
        self.qr.emit(&client_config, &paths.qr).await?;
        run.record(Artifact::QrImage(paths.qr.clone()));

        Ok(Provisioned {
            name: peer.name,
            public_key: peer.keys.public_key,
            allowed_ip,
            paths,
            server_config: self.server.path().to_path_buf(),
            client_config,
        })
    }

    /// Add the peer to the running interface with `wg set`
    async fn apply_live(&self, keys: &PeerKeys, allowed_ip: Ipv4Net) -> Result<String> {
        let interface = self
            .server
            .interface_name()
            .ok_or_else(|| {
                ProvisionError::invalid(format!(
                    "cannot derive an interface name from {}",
                    self.server.path().display()
                ))
            })?
            .to_string();

        let allowed_ip = allowed_ip.to_string();
        let mut args = vec![
            "set",
            interface.as_str(),
            "peer",
            keys.public_key.as_str(),
            "allowed-ips",
            allowed_ip.as_str(),
        ];
        let stdin = keys.preshared_key.as_ref().map(|psk| {
            args.extend(["preshared-key", "/dev/stdin"]);
            format!("{}\n", psk)
        });

        self.wg
            .run(&args, stdin.as_deref(), self.settings.tool_timeout())
            .await?;
        tracing::info!("Added peer {} to interface {}", keys.public_key, interface);
        Ok(interface)
    }
}

async fn read_name<R, W>(mut input: R, prompt: &mut W) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prompt_err = |e: std::io::Error| ProvisionError::io("failed to write prompt", e);
    prompt.write_all(b"Enter peer name: ").await.map_err(prompt_err)?;
    prompt.flush().await.map_err(prompt_err)?;

    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ProvisionError::invalid("peer name is not valid UTF-8")
            } else {
                ProvisionError::io("failed to read peer name", e)
            }
        })?;
    if read == 0 {
        return Err(ProvisionError::invalid("no peer name given (end of input)"));
    }
    Ok(line)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WireGuardConfig;
    use crate::error::ErrorKind;
    use std::path::Path;
    use tempfile::TempDir;

    const SERVER_PRIVATE: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
    const BOB_PUBLIC: &str = "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=";
    const CAROL_PUBLIC: &str = "hBFvDmn3cFvQOdxbFbOQ4KZ2NqXJcbI8K4TUQMmWYmQ=";

    struct Fixture {
        _dir: TempDir,
        server_config: PathBuf,
        output_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let server_config = dir.path().join("wg0.conf");
            let output_dir = dir.path().join("peers");
            std::fs::create_dir(&output_dir).unwrap();
            std::fs::write(
                &server_config,
                format!(
                    "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 51820\nPrivateKey = {}\n\n\
                     # Peer: bob\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.2/32\n\n\
                     [Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.3/32\n",
                    SERVER_PRIVATE, BOB_PUBLIC, CAROL_PUBLIC
                ),
            )
            .unwrap();
            Self {
                _dir: dir,
                server_config,
                output_dir,
            }
        }

        fn settings(&self) -> Settings {
            Settings {
                server_config: self.server_config.clone(),
                endpoint: Some("vpn.example.com".to_string()),
                output_dir: self.output_dir.clone(),
                native_keys: true,
                lock_timeout_secs: 1,
                ..Settings::default()
            }
        }

        fn server_text(&self) -> String {
            std::fs::read_to_string(&self.server_config).unwrap()
        }

        fn provisioner(&self, settings: Settings) -> Provisioner {
            self.provisioner_with(settings, fake_qrencode(), ToolCommand::new("sh"))
        }

        fn provisioner_with(&self, settings: Settings, qrencode: ToolCommand, wg: ToolCommand) -> Provisioner {
            let timeout = settings.tool_timeout();
            Provisioner::new(
                settings,
                Box::new(NativeKeyGenerator),
                Box::new(QrencodeEmitter::new(qrencode, timeout)),
                wg,
            )
        }
    }

    /// Writes stdin verbatim to the `-o` target, standing in for `qrencode`
    fn fake_qrencode() -> ToolCommand {
        ToolCommand::with_args("sh", ["-c", "cat > \"$4\"", "qrencode"])
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_end_to_end_alice() {
        let fx = Fixture::new();
        let before = fx.server_text();

        let done = fx.provisioner(fx.settings()).provision("alice").await.unwrap();
        assert_eq!(done.allowed_ip.to_string(), "10.0.0.4/32");

        let alice_dir = fx.output_dir.join("alice");
        let conf = std::fs::read_to_string(alice_dir.join("alice.conf")).unwrap();
        assert!(conf.contains("Address = 10.0.0.4/32\n"));
        assert!(conf.contains("Endpoint = vpn.example.com:51820\n"));

        // QR image holds exactly the config text (the fake encoder copies its input)
        let png = std::fs::read_to_string(alice_dir.join("alice.png")).unwrap();
        assert_eq!(png, conf);

        // Server config: old bytes untouched, matching stanza appended
        let after = fx.server_text();
        assert!(after.starts_with(&before));
        let appended = &after[before.len()..];
        assert!(appended.contains("# Peer: alice\n[Peer]\n"));
        assert!(appended.contains("AllowedIPs = 10.0.0.4/32\n"));
        assert!(appended.contains(&format!("PublicKey = {}\n", done.public_key)));

        // Client config parses back to the generated key and assigned address
        let client = WireGuardConfig::parse(&conf).unwrap();
        assert_eq!(client.interface.address, vec![done.allowed_ip]);
        assert_eq!(BASE64.encode(client.public_key()), done.public_key);
        let server = WireGuardConfig::parse(&after).unwrap();
        assert_eq!(client.peers[0].public_key, server.public_key());
        assert_eq!(server.peer_named("alice").unwrap().allowed_ips[0].to_string(), "10.0.0.4/32");
    }

    #[tokio::test]
    async fn test_same_name_twice_is_already_exists() {
        let fx = Fixture::new();
        let provisioner = fx.provisioner(fx.settings());
        provisioner.provision("alice").await.unwrap();

        let conf_path = fx.output_dir.join("alice/alice.conf");
        let conf_before = std::fs::read(&conf_path).unwrap();
        let server_before = fx.server_text();

        let err = provisioner.provision("alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.stage, Stage::Validating);
        assert!(err.completed.is_empty());

        assert_eq!(std::fs::read(&conf_path).unwrap(), conf_before);
        assert_eq!(fx.server_text(), server_before);
        assert_eq!(entries(&fx.output_dir.join("alice")), 2);
    }

    #[tokio::test]
    async fn test_name_recorded_in_server_config_is_already_exists() {
        let fx = Fixture::new();
        let before = fx.server_text();

        let err = fx.provisioner(fx.settings()).provision("bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(entries(&fx.output_dir), 0);
        assert_eq!(fx.server_text(), before);
    }

    #[tokio::test]
    async fn test_invalid_names_have_no_side_effects() {
        let fx = Fixture::new();
        let before = fx.server_text();
        let provisioner = fx.provisioner(fx.settings());

        for name in ["", "a/b"] {
            let err = provisioner.provision(name).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
            assert_eq!(err.stage, Stage::Validating);
            assert!(err.completed.is_empty());
            assert_eq!(err.exit_code(), 1);
        }

        assert_eq!(entries(&fx.output_dir), 0);
        assert_eq!(fx.server_text(), before);
        assert!(!fx.output_dir.join("a").exists());
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_before_writing() {
        let fx = Fixture::new();
        let settings = Settings {
            endpoint: None,
            ..fx.settings()
        };

        let err = fx.provisioner(settings).provision("alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(entries(&fx.output_dir), 0);
    }

    #[tokio::test]
    async fn test_malformed_server_config_is_rejected() {
        let fx = Fixture::new();
        std::fs::write(&fx.server_config, "[Interface]\nAddress = 10.0.0.1/24\n???\n").unwrap();

        let err = fx.provisioner(fx.settings()).provision("alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.completed.is_empty());
        assert_eq!(entries(&fx.output_dir), 0);
    }

    #[tokio::test]
    async fn test_qr_failure_reports_completed_steps() {
        let fx = Fixture::new();
        let broken = ToolCommand::with_args("sh", ["-c", "echo 'cannot open output' >&2; exit 2", "qrencode"]);
        let provisioner = fx.provisioner_with(fx.settings(), broken, ToolCommand::new("sh"));

        let err = provisioner.provision("alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
        assert_eq!(err.stage, Stage::Rendering);
        assert_eq!(
            err.completed,
            vec![
                Artifact::PeerDirectory(fx.output_dir.join("alice")),
                Artifact::ClientConfig(fx.output_dir.join("alice/alice.conf")),
                Artifact::ServerStanza(fx.server_config.clone()),
            ]
        );
        let message = err.to_string();
        assert!(message.contains("cannot open output"));
        assert!(message.contains("appended [Peer]"));
    }

    #[tokio::test]
    async fn test_missing_wg_fails_preflight() {
        let fx = Fixture::new();
        let settings = Settings {
            native_keys: false,
            ..fx.settings()
        };
        let provisioner = fx.provisioner_with(
            settings,
            fake_qrencode(),
            ToolCommand::new("definitely-not-a-real-tool-7f3a"),
        );

        let err = provisioner.provision("alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
        assert_eq!(err.stage, Stage::Validating);
        assert_eq!(entries(&fx.output_dir), 0);
    }

    #[tokio::test]
    async fn test_apply_runs_wg_set() {
        let fx = Fixture::new();
        let record = fx.output_dir.parent().unwrap().join("wg-calls");
        let script = format!("echo \"$@\" > '{}'; cat >> '{}'", record.display(), record.display());
        let wg = ToolCommand::with_args("sh", ["-c".to_string(), script, "wg".to_string()]);
        let settings = Settings {
            apply: true,
            preshared_key: true,
            ..fx.settings()
        };

        let done = fx
            .provisioner_with(settings, fake_qrencode(), wg)
            .provision("alice")
            .await
            .unwrap();

        let calls = std::fs::read_to_string(&record).unwrap();
        assert!(calls.starts_with(&format!(
            "set wg0 peer {} allowed-ips 10.0.0.4/32 preshared-key /dev/stdin\n",
            done.public_key
        )));
        let conf = std::fs::read_to_string(&done.paths.config).unwrap();
        let psk_line = conf.lines().find(|l| l.starts_with("PresharedKey = ")).unwrap();
        assert!(calls.contains(psk_line.trim_start_matches("PresharedKey = ")));
        assert!(fx.server_text().contains(psk_line));
    }

    #[tokio::test]
    async fn test_run_reads_name_from_prompt() {
        let fx = Fixture::new();
        let mut prompt = Vec::new();

        let done = fx
            .provisioner(fx.settings())
            .run(&b"  dave \n"[..], &mut prompt)
            .await
            .unwrap();
        assert_eq!(done.name.as_str(), "dave");
        assert_eq!(String::from_utf8(prompt).unwrap(), "Enter peer name: ");
        assert!(fx.output_dir.join("dave/dave.conf").is_file());
    }

    #[tokio::test]
    async fn test_run_without_input_is_invalid() {
        let fx = Fixture::new();
        let err = fx
            .provisioner(fx.settings())
            .run(&b""[..], tokio::io::sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.stage, Stage::AwaitingName);
    }

    #[tokio::test]
    async fn test_run_with_non_utf8_name_is_invalid() {
        let fx = Fixture::new();
        let err = fx
            .provisioner(fx.settings())
            .run(&b"al\xffice\n"[..], tokio::io::sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.stage, Stage::AwaitingName);
        assert!(err.completed.is_empty());
        assert_eq!(std::fs::read_dir(&fx.output_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sequential_runs_get_distinct_addresses() {
        let fx = Fixture::new();
        let provisioner = fx.provisioner(fx.settings());

        let mut seen = Vec::new();
        for name in ["p1", "p2", "p3", "p4"] {
            let done = provisioner.provision(name).await.unwrap();
            assert!(!seen.contains(&done.allowed_ip));
            seen.push(done.allowed_ip);
        }
        assert_eq!(
            seen.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
            ["10.0.0.4/32", "10.0.0.5/32", "10.0.0.6/32", "10.0.0.7/32"]
        );
    }
}
