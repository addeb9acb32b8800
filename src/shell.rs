//! The root shell session: launches apps by voice and hosts them until exit.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vios_router::{Router, RouterError, Session, Supervisor, kind};

const SHELL_CHOICES: [&str; 3] = ["active", "shell", "monomorphic"];
const EXIT: &str = "exit";

/// How long the shell sleeps between non-blocking reads while an app is
/// in the foreground.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Repeats whatever the user dictates until they say the end token.
pub async fn echo(session: Arc<Session>) -> Result<(), RouterError> {
    while !session.is_interrupted() {
        let text = session
            .start_dictation("stop echo", "Say something to echo.")
            .await?;
        if session.is_interrupted() {
            break;
        }
        session.synthesize(&text).await?;
    }
    Ok(())
}

/// Register the apps the shell can launch.
pub fn register_apps(supervisor: &mut Supervisor) {
    supervisor.register("echo", echo);
}

/// Run the shell until the user says "exit", then shut every app down.
pub async fn run(router: Router) -> Result<()> {
    let shell = Session::new(router.clone(), "shell");
    let id = shell.start();
    info!(instance_id = %id, "Registered shell");

    let mut supervisor = Supervisor::new(router);
    register_apps(&mut supervisor);

    shell.synthesize("Welcome to VIOS.").await?;

    let shell_choices: Vec<String> = SHELL_CHOICES.iter().map(|s| s.to_string()).collect();
    let mut top_level = supervisor.names();
    top_level.extend(shell_choices.iter().cloned());
    top_level.push(EXIT.to_string());

    loop {
        let choice = if supervisor.active().is_none() {
            shell
                .grammar_prompt_and_read(Some(top_level.clone()), "Choose app, active, or exit.")
                .await?
        } else {
            match shell.read(None, false).await? {
                Some(message) => message.args,
                None => {
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            }
        };

        match choice.as_str() {
            name if supervisor.contains(name) => {
                shell.set_choices(shell_choices.clone()).await?;
                supervisor.launch(name).await?;
            }
            "active" => match supervisor.active() {
                Some(name) => {
                    let text = format!("Active app is {name}.");
                    shell.synthesize(&text).await?;
                }
                None => shell.synthesize("No active apps.").await?,
            },
            "shell" => {
                if supervisor.active().is_none() {
                    shell.synthesize("Already in shell.").await?;
                } else {
                    shell.synthesize("Backgrounding app.").await?;
                    supervisor.background_active();
                }
            }
            "monomorphic" => monomorphic(&shell, &mut supervisor).await?,
            EXIT => break,
            other => warn!(choice = %other, "Shell received unrecognized input"),
        }
    }

    info!("Closing apps");
    supervisor.shutdown().await;

    shell.synthesize("Goodbye.").await?;
    shell.send(kind::CLEAR_INSTANCE, "", None).await?;
    shell.cleanup();
    Ok(())
}

/// Silence the active app's vocabulary until the user says "polymorphic".
async fn monomorphic(shell: &Session, supervisor: &mut Supervisor) -> Result<(), RouterError> {
    let active = supervisor.active().map(str::to_string);
    let app = active.and_then(|name| supervisor.session(&name));

    if let Some(app) = &app {
        app.disable_grammar().await?;
    }

    let saved = shell.choices();
    let confirm = shell
        .grammar_prompt_and_read(
            Some(vec!["no".to_string(), "yes".to_string()]),
            "Confirm monomorphic mode.",
        )
        .await?;

    if confirm == "yes" {
        shell
            .grammar_prompt_and_read(
                Some(vec!["polymorphic".to_string()]),
                "Entering monomorphic mode.",
            )
            .await?;
        shell.synthesize("Returned to polymorphic mode.").await?;
    }
    shell.set_choices(saved).await?;

    if let Some(app) = &app {
        app.reenable_grammar().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use vios_router::connection::{FrameInbound, FrameOutbound};
    use vios_router::{ByteOrder, Message, RouterConfig};

    struct Engine {
        outbound: FrameOutbound,
        inbound: FrameInbound,
    }

    impl Engine {
        async fn send(&mut self, instance: &str, kind: &str, id: &str, args: &str) {
            let payload = format!(">>{instance}|{kind}|{id}|{args}<<");
            self.outbound.send_raw(payload.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.inbound.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            Message::decode_bytes(&frame).unwrap()
        }

        /// Answer a `synthesisDone` request and return the text then spoken.
        async fn speak(&mut self) -> String {
            let request = self.recv().await;
            assert_eq!(request.kind, kind::SYNTHESIS_DONE);
            self.send(
                &request.instance_id,
                kind::SYNTHESIS_DONE,
                &request.message_id,
                "synthesis done",
            )
            .await;
            let spoken = self.recv().await;
            assert_eq!(spoken.kind, kind::SPEECH_SYNTH);
            spoken.args
        }
    }

    fn connect() -> (Router, Engine) {
        let (router_io, engine_io) = tokio::io::duplex(64 * 1024);
        let (router_read, router_write) = tokio::io::split(router_io);
        let (engine_read, engine_write) = tokio::io::split(engine_io);

        let config = RouterConfig::builder()
            .ingest_pause(Duration::ZERO)
            .build();
        let router = Router::new(router_write, config.clone());
        router.spawn(router_read);

        let engine = Engine {
            outbound: FrameOutbound::new(engine_write, ByteOrder::Little),
            inbound: FrameInbound::new(engine_read, ByteOrder::Little, config.max_frame_len),
        };
        (router, engine)
    }

    #[tokio::test]
    async fn test_echo_repeats_dictation() {
        let (router, mut engine) = connect();
        let shell = Session::new(router.clone(), "shell");
        shell.start();

        let mut supervisor = Supervisor::new(router.clone());
        register_apps(&mut supervisor);
        let app = supervisor.launch("echo").await.unwrap();

        assert_eq!(engine.speak().await, "Say something to echo.");
        let request = engine.recv().await;
        assert_eq!(request.kind, kind::START_DICTATION);
        assert_eq!(request.args, "stop echo");

        engine
            .send("1", kind::DICTATION_RESULT, "1", "hello there")
            .await;
        assert_eq!(engine.speak().await, "hello there");

        // the next prompt is waiting on the synthesizer when the shell exits
        let request = engine.recv().await;
        assert_eq!(request.kind, kind::SYNTHESIS_DONE);
        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
        assert!(!app.is_initialized());
    }

    #[tokio::test]
    async fn test_relaunched_echo_keeps_its_input() {
        let (router, mut engine) = connect();
        let shell = Session::new(router.clone(), "shell");
        shell.start();

        let mut supervisor = Supervisor::new(router.clone());
        register_apps(&mut supervisor);
        let app = supervisor.launch("echo").await.unwrap();

        assert_eq!(engine.speak().await, "Say something to echo.");
        assert_eq!(engine.recv().await.kind, kind::START_DICTATION);

        // echo is blocked waiting for dictation while it is sent away and back
        assert_eq!(supervisor.background_active(), Some("echo".to_string()));
        let relaunched = tokio::time::timeout(Duration::from_secs(1), supervisor.launch("echo"))
            .await
            .expect("relaunch must not wait on the app's buffer")
            .unwrap();
        assert_eq!(relaunched.instance_id(), app.instance_id());

        let announced = engine.recv().await;
        assert_eq!(announced.kind, kind::GRAMMAR_SET);
        assert_eq!(announced.instance_id, "2");

        // the app repeats its prompt itself and does not mistake the reply for input
        assert_eq!(engine.speak().await, "Say something to echo.");
        engine
            .send("1", kind::DICTATION_RESULT, "1", "hello again")
            .await;
        assert_eq!(engine.speak().await, "hello again");

        assert_eq!(engine.recv().await.kind, kind::SYNTHESIS_DONE);
        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shell_exits_on_command() {
        let (router, mut engine) = connect();
        let shell = tokio::spawn(run(router.clone()));

        assert_eq!(engine.speak().await, "Welcome to VIOS.");
        let announced = engine.recv().await;
        assert_eq!(announced.kind, kind::GRAMMAR_SET);
        assert_eq!(announced.args, "echo,active,shell,monomorphic,exit");
        assert_eq!(engine.speak().await, "Choose app, active, or exit.");

        engine.send("1", kind::GRAMMAR_MATCH, "1", "exit").await;
        assert_eq!(engine.recv().await.kind, kind::BREAK);
        assert_eq!(engine.speak().await, "Goodbye.");
        assert_eq!(engine.recv().await.kind, kind::CLEAR_INSTANCE);

        shell.await.unwrap().unwrap();
        assert_eq!(router.grammar().resolve_instance("exit"), None);
    }
}
