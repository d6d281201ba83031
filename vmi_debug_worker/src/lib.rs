// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A worker which runs a gdbstub event loop against a domain debugger,
//! exposing pause/resume, registers, memory, and breakpoints over the GDB
//! remote serial protocol.

mod gdb;

pub use gdb::targets::TargetArch;
pub use gdb::targets::VmTarget;
pub use gdb::SessionProxy;

use gdbstub::stub::GdbStubError;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use vmi_core::AccessMode;
use vmi_core::DomainDebugger;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::StopReason;

/// How long to wait on the domain before checking the socket for client
/// traffic while the guest is running.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct DebuggerParameters {
    pub listener: TcpListener,
    pub domain: Arc<DomainDebugger>,
}

/// The protocol adapter serving one client connection. Implementations own
/// the wire format; the proxy owns the session.
pub trait DebugStub: Send + Sync {
    fn serve(&self, socket: TcpStream, proxy: &mut SessionProxy) -> anyhow::Result<()>;
}

/// [`DebugStub`] speaking the GDB remote serial protocol with the stock
/// x86-64 SSE register file.
pub struct GdbStubAdapter;

impl DebugStub for GdbStubAdapter {
    fn serve(&self, socket: TcpStream, proxy: &mut SessionProxy) -> anyhow::Result<()> {
        run_state_machine(
            socket,
            VmTarget::<gdbstub_arch::x86::X86_64_SSE>::new(proxy),
        )
        .map_err(anyhow::Error::new)
    }
}

/// Accepts debugger clients one at a time, attaching an exclusive session to
/// the domain for the lifetime of each connection.
pub struct DebuggerWorker {
    listener: TcpListener,
    domain: Arc<DomainDebugger>,
    stub: Box<dyn DebugStub>,
}

impl DebuggerWorker {
    pub fn new(params: DebuggerParameters) -> Self {
        Self {
            listener: params.listener,
            domain: params.domain,
            stub: Box::new(GdbStubAdapter),
        }
    }

    pub fn with_stub(params: DebuggerParameters, stub: Box<dyn DebugStub>) -> Self {
        Self {
            listener: params.listener,
            domain: params.domain,
            stub,
        }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        if let Ok(address) = self.listener.local_addr() {
            tracing::info!(address = %address, domain = %self.domain.id(), "gdbstub listening");
        }

        loop {
            let (socket, address) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to accept connection"
                    );
                    continue;
                }
            };
            tracing::info!(address = %address, "GDB client connected");

            let session = match self.domain.attach_session(AccessMode::Exclusive) {
                Ok(session) => session,
                Err(err @ VmiError::State { .. }) => {
                    // The domain is gone. No future client can attach either.
                    tracing::info!(
                        error = &err as &dyn std::error::Error,
                        "domain no longer debuggable, stopping"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to attach session"
                    );
                    continue;
                }
            };

            let mut proxy = SessionProxy::new(session);
            if let Err(err) = self.stub.serve(socket, &mut proxy) {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "debugger session ended with error"
                );
            }
            if let Err(err) = proxy.into_session().detach() {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to detach session"
                );
            }
            tracing::info!(address = %address, "GDB client disconnected");
        }
    }
}

fn to_target_error(err: VmiError) -> GdbStubError<anyhow::Error, std::io::Error> {
    GdbStubError::TargetError(err.into())
}

fn run_state_machine<T: TargetArch>(
    socket: TcpStream,
    mut vm_target: VmTarget<'_, T>,
) -> Result<(), GdbStubError<anyhow::Error, std::io::Error>> {
    use gdbstub::common::Signal;
    use gdbstub::stub::state_machine::GdbStubStateMachine;
    use gdbstub::stub::DisconnectReason;
    use gdbstub::stub::GdbStub;
    use gdbstub::stub::MultiThreadStopReason;

    // The client expects the target stopped on attach. Consume the pause
    // stop here so it is not replayed as a spurious break later.
    vm_target.session().pause().map_err(to_target_error)?;
    let _ = vm_target.session().wait_for_stop(Duration::ZERO);

    let connection = SocketConnection(socket);
    let mut gdb = GdbStub::new(connection).run_state_machine(&mut vm_target)?;

    let disconnect_reason = loop {
        gdb = match gdb {
            GdbStubStateMachine::Idle(mut gdb) => {
                let byte = gdb
                    .borrow_conn()
                    .read_byte_blocking()
                    .map_err(GdbStubError::ConnectionRead)?;
                gdb.incoming_data(&mut vm_target, byte)?
            }
            GdbStubStateMachine::Disconnected(gdb) => break gdb.get_reason(),
            GdbStubStateMachine::CtrlCInterrupt(gdb) => {
                vm_target.session().pause().map_err(to_target_error)?;
                let _ = vm_target.session().wait_for_stop(Duration::ZERO);
                gdb.interrupt_handled(
                    &mut vm_target,
                    Some(MultiThreadStopReason::Signal(Signal::SIGINT)),
                )?
            }
            GdbStubStateMachine::Running(mut gdb) => {
                enum Event {
                    Stop(StopReason),
                    IncomingData(u8),
                }

                // Alternate between pumping domain events and checking the
                // socket for an interrupt packet.
                let event = loop {
                    if let Some(stop) = vm_target
                        .session()
                        .wait_for_stop(STOP_POLL_INTERVAL)
                        .map_err(to_target_error)?
                    {
                        break Event::Stop(stop);
                    }
                    match gdb.borrow_conn().read_byte_timeout(STOP_POLL_INTERVAL) {
                        Ok(Some(byte)) => break Event::IncomingData(byte),
                        Ok(None) => {}
                        Err(err) => return Err(GdbStubError::ConnectionRead(err)),
                    }
                };
                match event {
                    Event::IncomingData(byte) => gdb.incoming_data(&mut vm_target, byte)?,
                    Event::Stop(stop) => {
                        let stop_reason = translate_stop::<T>(&vm_target, stop);
                        gdb.report_stop(&mut vm_target, stop_reason)?
                    }
                }
            }
        };
    };

    match disconnect_reason {
        DisconnectReason::Disconnect => tracing::info!("GDB client disconnected"),
        DisconnectReason::TargetExited(code) => {
            tracing::info!(code, "domain exited")
        }
        DisconnectReason::TargetTerminated(signal) => {
            tracing::info!(%signal, "domain terminated")
        }
        DisconnectReason::Kill => tracing::info!("GDB client sent kill"),
    }

    Ok(())
}

fn translate_stop<T: TargetArch>(
    target: &SessionProxy,
    stop: StopReason,
) -> gdbstub::stub::MultiThreadStopReason<T::Usize> {
    use gdbstub::common::Signal;
    use gdbstub::stub::MultiThreadStopReason;
    use gdbstub::target::ext::breakpoints::WatchKind;

    match stop {
        StopReason::Break => MultiThreadStopReason::Signal(Signal::SIGINT),
        StopReason::PowerOff => MultiThreadStopReason::Exited(0),
        StopReason::TripleFault { vp } => MultiThreadStopReason::SignalWithThread {
            tid: target.vp_to_tid(vp),
            signal: Signal::SIGSEGV,
        },
        StopReason::SingleStep { vp } => {
            // WinDbg's GDB client handles a trap signal more gracefully than
            // a bare DoneStep here.
            MultiThreadStopReason::SignalWithThread {
                tid: target.vp_to_tid(vp),
                signal: Signal::SIGTRAP,
            }
        }
        StopReason::Breakpoint {
            vp, address, kind, ..
        } => {
            let tid = target.vp_to_tid(vp);
            match kind {
                BreakpointKind::Software => MultiThreadStopReason::SwBreak(tid),
                BreakpointKind::Hardware => MultiThreadStopReason::HwBreak(tid),
                BreakpointKind::WatchRead
                | BreakpointKind::WatchWrite
                | BreakpointKind::WatchAccess => {
                    if let Ok(addr) = T::Address::try_from(address) {
                        MultiThreadStopReason::Watch {
                            tid,
                            kind: match kind {
                                BreakpointKind::WatchRead => WatchKind::Read,
                                BreakpointKind::WatchWrite => WatchKind::Write,
                                _ => WatchKind::ReadWrite,
                            },
                            addr,
                        }
                    } else {
                        tracing::error!(address, "watchpoint address out of range for arch");
                        MultiThreadStopReason::Signal(Signal::SIGINT)
                    }
                }
            }
        }
    }
}

/// A blocking TCP connection with explicit timeout control, so the running
/// state can poll the socket without dedicating a thread to it.
struct SocketConnection(TcpStream);

impl SocketConnection {
    fn read_byte_blocking(&mut self) -> std::io::Result<u8> {
        use std::io::Read;
        self.0.set_read_timeout(None)?;
        let mut buf = [0];
        self.0.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_byte_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        use std::io::Read;
        self.0.set_read_timeout(Some(timeout))?;
        let mut buf = [0];
        match self.0.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf[0])),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl gdbstub::conn::Connection for SocketConnection {
    type Error = std::io::Error;

    fn write(&mut self, byte: u8) -> Result<(), Self::Error> {
        // Qualified since gdbstub also implements `Connection` for
        // `TcpStream`, making the method name ambiguous with `io::Write`.
        std::io::Write::write_all(&mut self.0, &[byte])
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0)
    }
}
