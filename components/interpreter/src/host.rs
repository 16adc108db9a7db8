//! Host object protocol and host capability seams.
//!
//! Native-implemented objects declare a static descriptor list of
//! `(name, handler)` pairs; [`ProtoBuilder`] turns one into a prototype
//! object whose property map holds bound native-function values. The VM's
//! call path sees no difference between script functions and natives
//! except the calling convention: natives receive `(eu, this, nparams)`
//! and read their arguments from the value stack by offset from the top.
//!
//! Concrete transports (DNS, pins, sockets) sit behind traits so the
//! runtime tests with deterministic in-memory implementations.

use crate::execution_unit::{ExecutionUnit, NativeFn};
use core_types::{Atom, ObjectId, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::rc::Rc;

// ---- console ----

/// Sink for `print`/`println` output.
pub trait ConsoleWriter {
    /// Writes a fragment without adding a newline.
    fn write(&mut self, text: &str);
}

/// Writer backed by process stdout.
#[derive(Debug, Default)]
pub struct StdoutWriter;

impl ConsoleWriter for StdoutWriter {
    fn write(&mut self, text: &str) {
        print!("{}", text);
    }
}

/// Writer that captures output for tests.
#[derive(Debug, Default)]
pub struct CaptureWriter {
    buffer: String,
}

impl CaptureWriter {
    /// Creates an empty capture buffer.
    pub fn new() -> Self {
        CaptureWriter::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> &str {
        &self.buffer
    }
}

impl ConsoleWriter for CaptureWriter {
    fn write(&mut self, text: &str) {
        self.buffer.push_str(text);
    }
}

// ---- events ----

/// A queued event: a callable, its receiver, and its arguments.
///
/// While the record sits in the queue its values are pinned as GC roots;
/// the pin is released when the record is taken for delivery (the values
/// are on the VM stack from then on).
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// The function to call.
    pub func: Value,
    /// The `this` binding for the call.
    pub this: Value,
    /// Arguments, left to right.
    pub args: Vec<Value>,
    /// Whether delivering this event ends the operation that was being
    /// listened for.
    pub stop_listening: bool,
}

// ---- hostname resolution ----

/// Seam for `IPAddr.lookupHostname`.
pub trait HostnameResolver {
    /// Resolves a hostname to an IPv4 address, or `None` on failure.
    fn lookup(&self, hostname: &str) -> Option<[u8; 4]>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default)]
pub struct StdResolver;

impl HostnameResolver for StdResolver {
    fn lookup(&self, hostname: &str) -> Option<[u8; 4]> {
        let addrs = (hostname, 0u16).to_socket_addrs().ok()?;
        for addr in addrs {
            if let std::net::IpAddr::V4(v4) = addr.ip() {
                return Some(v4.octets());
            }
        }
        None
    }
}

/// Resolver that answers every lookup with a fixed address; used by tests
/// and offline hosts.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub [u8; 4]);

impl HostnameResolver for FixedResolver {
    fn lookup(&self, _hostname: &str) -> Option<[u8; 4]> {
        Some(self.0)
    }
}

// ---- GPIO ----

/// Seam for the GPIO builtin.
pub trait GpioBackend {
    /// Configures a pin's mode.
    fn set_pin_mode(&mut self, pin: u8, mode: u8);
    /// Drives an output pin.
    fn digital_write(&mut self, pin: u8, level: bool);
    /// Samples an input pin.
    fn digital_read(&mut self, pin: u8) -> bool;
}

/// In-memory pin simulation; reads observe the last write.
#[derive(Debug, Default)]
pub struct SimulatedPins {
    modes: HashMap<u8, u8>,
    levels: HashMap<u8, bool>,
}

impl SimulatedPins {
    /// Fresh simulation with all pins low.
    pub fn new() -> Self {
        SimulatedPins::default()
    }

    /// Last configured mode of a pin.
    pub fn mode(&self, pin: u8) -> Option<u8> {
        self.modes.get(&pin).copied()
    }
}

impl GpioBackend for SimulatedPins {
    fn set_pin_mode(&mut self, pin: u8, mode: u8) {
        self.modes.insert(pin, mode);
    }

    fn digital_write(&mut self, pin: u8, level: bool) {
        self.levels.insert(pin, level);
    }

    fn digital_read(&mut self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(false)
    }
}

// ---- sockets ----

/// Seam for the TCP/UDP builtins' transmit path. Inbound data arrives as
/// events through the scheduler queue, keeping per-source order.
pub trait SocketBackend {
    /// Sends on a TCP connection.
    fn tcp_send(&mut self, port: u16, data: &str);
    /// Sends a UDP datagram.
    fn udp_send(&mut self, addr: [u8; 4], port: u16, data: &str);
    /// Closes a TCP connection.
    fn tcp_disconnect(&mut self, port: u16);
}

/// Records traffic instead of transmitting; the default host binding for
/// tests and detached runs.
#[derive(Debug, Default)]
pub struct LoopbackSockets {
    sent: Vec<String>,
}

impl LoopbackSockets {
    /// Fresh loopback with no traffic.
    pub fn new() -> Self {
        LoopbackSockets::default()
    }

    /// Everything sent so far, rendered one line per operation.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl SocketBackend for LoopbackSockets {
    fn tcp_send(&mut self, port: u16, data: &str) {
        self.sent.push(format!("tcp:{} {}", port, data));
    }

    fn udp_send(&mut self, addr: [u8; 4], port: u16, data: &str) {
        self.sent.push(format!(
            "udp:{}.{}.{}.{}:{} {}",
            addr[0], addr[1], addr[2], addr[3], port, data
        ));
    }

    fn tcp_disconnect(&mut self, port: u16) {
        self.sent.push(format!("tcp:{} <disconnect>", port));
    }
}

// ---- prototype builder ----

/// Builds a prototype object from a static descriptor table.
///
/// The resulting object is pinned against collection and registered as a
/// global under its name, matching the lifetime of a built-in.
pub struct ProtoBuilder<'e> {
    eu: &'e mut ExecutionUnit,
    object: ObjectId,
}

impl<'e> ProtoBuilder<'e> {
    /// Starts a prototype registered as global `name`.
    pub fn new(eu: &'e mut ExecutionUnit, name: Atom) -> Self {
        let object = {
            let heap_rc = eu.heap();
            let mut heap = heap_rc.borrow_mut();
            let mut proto = memory_manager::Object::mater();
            proto.set_collectable(false);
            heap.create_object(proto)
        };
        eu.register_global(name, Value::Obj(object));
        ProtoBuilder { eu, object }
    }

    /// Adds one native method from a descriptor pair.
    pub fn method(self, name: Atom, handler: NativeFn) -> Self {
        let idx = self.eu.register_native(handler);
        let func = {
            let heap_rc = self.eu.heap();
            let mut heap = heap_rc.borrow_mut();
            heap.create_object(memory_manager::Object::native(idx))
        };
        {
            let heap_rc = self.eu.heap();
            let mut heap = heap_rc.borrow_mut();
            if let Some(o) = heap.object_mut(self.object) {
                o.set_property(name, Value::Obj(func));
            }
        }
        self
    }

    /// Adds every method in a descriptor table.
    pub fn methods(mut self, descriptors: &[(Atom, NativeFn)]) -> Self {
        for &(name, handler) in descriptors {
            self = self.method(name, handler);
        }
        self
    }

    /// Adds a data property.
    pub fn property(self, name: Atom, value: Value) -> Self {
        let heap_rc = self.eu.heap();
        let mut heap = heap_rc.borrow_mut();
        if let Some(o) = heap.object_mut(self.object) {
            o.set_property(name, value);
        }
        drop(heap);
        self
    }

    /// Finishes, returning the prototype's handle.
    pub fn build(self) -> ObjectId {
        self.object
    }
}

/// Registers a bare native function as a global, for the runtime's
/// free-function builtins (`print`, `delay`, ...).
pub fn register_global_function(eu: &mut ExecutionUnit, name: Atom, handler: NativeFn) {
    let idx = eu.register_native(handler);
    let func = {
        let heap_rc = eu.heap();
        let mut heap = heap_rc.borrow_mut();
        let mut o = memory_manager::Object::native(idx);
        o.set_collectable(false);
        heap.create_object(o)
    };
    eu.register_global(name, Value::Obj(func));
}

/// Shared handle type for console writers.
pub type ConsoleHandle = Rc<RefCell<dyn ConsoleWriter>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_writer() {
        let mut w = CaptureWriter::new();
        w.write("a");
        w.write("b");
        assert_eq!(w.contents(), "ab");
    }

    #[test]
    fn test_fixed_resolver() {
        let r = FixedResolver([10, 0, 0, 1]);
        assert_eq!(r.lookup("anything.test"), Some([10, 0, 0, 1]));
    }

    #[test]
    fn test_simulated_pins() {
        let mut pins = SimulatedPins::new();
        pins.set_pin_mode(4, 1);
        assert_eq!(pins.mode(4), Some(1));
        assert!(!pins.digital_read(4));
        pins.digital_write(4, true);
        assert!(pins.digital_read(4));
    }

    #[test]
    fn test_loopback_sockets_record() {
        let mut sockets = LoopbackSockets::new();
        sockets.udp_send([192, 168, 0, 1], 8080, "ping");
        sockets.tcp_send(23, "hello");
        sockets.tcp_disconnect(23);
        assert_eq!(sockets.sent().len(), 3);
        assert!(sockets.sent()[0].starts_with("udp:192.168.0.1:8080"));
    }
}
