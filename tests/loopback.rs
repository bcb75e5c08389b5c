//! End-to-end exchange between a client machine and a server service
//! over localhost: version handshake, a build command, and teardown.

use palisade::codec::{BuildType, Value};
use palisade::machine::SharedState;
use palisade::session::SharedHandler;
use palisade::{
    Acceptor, Event, Machine, MachineDriver, Service, Session, State, StopMode, PROTOCOL_VERSION,
};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

/// Server-side opening state: check the protocol version, then hand
/// the connection to the play state.
struct ServerGreeting;

impl State for ServerGreeting {
    fn handle(&self, machine: &mut Machine, event: Event) -> bool {
        if event != Event::Recv {
            return false;
        }
        if let Some(values) = machine.recv("version %u") {
            match values.as_slice() {
                [Value::Uint(version)] if *version == PROTOCOL_VERSION => {
                    machine.send_line("welcome");
                    machine.goto(Arc::new(ServerPlay), "play");
                }
                _ => {
                    machine.send_line("reject");
                    if let Some(session) = machine.session() {
                        session.close();
                    }
                }
            }
            return true;
        }
        false
    }
}

/// Server-side play state: acknowledge build commands, honor quit.
struct ServerPlay;

impl State for ServerPlay {
    fn handle(&self, machine: &mut Machine, event: Event) -> bool {
        if event != Event::Recv {
            return false;
        }
        if let Some(values) = machine.recv("built %B %d %d %d") {
            if let [Value::Build(build), ..] = values.as_slice() {
                machine.send("built ok %B", &[Value::Build(*build)]);
            }
            return true;
        }
        if machine.recv("quit").is_some() {
            if let Some(session) = machine.session() {
                session.close();
            }
            return true;
        }
        false
    }
}

struct GameAcceptor;

#[async_trait::async_trait]
impl Acceptor for GameAcceptor {
    async fn on_accept(&self, _session: &Session) -> SharedHandler {
        let mut machine = Machine::new("server-player");
        machine.goto(Arc::new(ServerGreeting), "greeting");
        Arc::new(MachineDriver::new(Arc::new(Mutex::new(machine))))
    }
}

/// Client-side opening state: announce the version, wait for welcome.
struct ClientStart {
    log: Arc<StdMutex<Vec<String>>>,
    done: Arc<Notify>,
}

impl State for ClientStart {
    fn handle(&self, machine: &mut Machine, event: Event) -> bool {
        match event {
            Event::NetConnect => {
                machine.send("version %u", &[Value::Uint(PROTOCOL_VERSION)]);
                false
            }
            Event::Recv => {
                if machine.recv("welcome").is_some() {
                    let build: SharedState = Arc::new(ClientBuild {
                        log: self.log.clone(),
                        done: self.done.clone(),
                    });
                    machine.goto(build, "build");
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

/// Client-side build state: place a settlement on entry, record the
/// acknowledgement.
struct ClientBuild {
    log: Arc<StdMutex<Vec<String>>>,
    done: Arc<Notify>,
}

impl State for ClientBuild {
    fn handle(&self, machine: &mut Machine, event: Event) -> bool {
        match event {
            Event::Enter => {
                machine.send(
                    "built %B %d %d %d",
                    &[
                        Value::Build(BuildType::Settlement),
                        Value::Int(3),
                        Value::Int(4),
                        Value::Int(1),
                    ],
                );
                false
            }
            Event::Recv => {
                if let Some(values) = machine.recv("built ok %B") {
                    self.log.lock().unwrap().push(format!("{values:?}"));
                    self.done.notify_one();
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

#[tokio::test]
async fn client_and_server_machines_exchange_commands() -> anyhow::Result<()> {
    let service = Service::listen(0, Arc::new(GameAcceptor)).await?;

    let log = Arc::new(StdMutex::new(Vec::new()));
    let done = Arc::new(Notify::new());
    let mut machine = Machine::new("client");
    machine.goto(
        Arc::new(ClientStart {
            log: log.clone(),
            done: done.clone(),
        }),
        "start",
    );
    let machine = Arc::new(Mutex::new(machine));
    let session = Machine::connect(machine.clone(), "127.0.0.1", service.port()).await?;

    timeout(Duration::from_secs(5), done.notified()).await?;
    assert!(log.lock().unwrap()[0].contains("Settlement"));
    assert_eq!(machine.lock().await.current_name(), Some("build"));

    session.close();
    session.closed().await;
    service.stop(StopMode::AfterLastSession).await;
    Ok(())
}

#[tokio::test]
async fn version_mismatch_is_rejected_and_closed() -> anyhow::Result<()> {
    let service = Service::listen(0, Arc::new(GameAcceptor)).await?;

    let peer = TcpStream::connect(("127.0.0.1", service.port())).await?;
    let mut reader = BufReader::new(peer);
    reader.get_mut().write_all(b"version 2\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    assert_eq!(line, "reject\n");

    // The server closes the connection after rejecting.
    line.clear();
    let n = timeout(Duration::from_secs(5), reader.read_line(&mut line)).await??;
    assert_eq!(n, 0);

    service.stop(StopMode::Now).await;
    Ok(())
}

#[tokio::test]
async fn server_machine_sees_net_close() -> anyhow::Result<()> {
    // A machine whose global handler records the close event.
    struct CloseWatcher {
        closed: Arc<Notify>,
    }
    impl State for CloseWatcher {
        fn handle(&self, _machine: &mut Machine, event: Event) -> bool {
            if event == Event::NetClose {
                self.closed.notify_one();
            }
            false
        }
    }
    struct WatchingAcceptor {
        closed: Arc<Notify>,
    }
    #[async_trait::async_trait]
    impl Acceptor for WatchingAcceptor {
        async fn on_accept(&self, _session: &Session) -> SharedHandler {
            let mut machine = Machine::new("server-player");
            machine.goto(Arc::new(ServerGreeting), "greeting");
            machine.set_global_handler(Arc::new(CloseWatcher {
                closed: self.closed.clone(),
            }));
            Arc::new(MachineDriver::new(Arc::new(Mutex::new(machine))))
        }
    }

    let closed = Arc::new(Notify::new());
    let service = Service::listen(
        0,
        Arc::new(WatchingAcceptor {
            closed: closed.clone(),
        }),
    )
    .await?;

    let peer = TcpStream::connect(("127.0.0.1", service.port())).await?;
    drop(peer);

    timeout(Duration::from_secs(5), closed.notified()).await?;
    service.stop(StopMode::Now).await;
    Ok(())
}
