//! Windows named-pipe publishing backend.
//!
//! Each endpoint owns two overlapped pipe instances so a finishing
//! reader and a starting reader can briefly overlap. One worker thread
//! serves up to 20 endpoints, waiting on `{stop_event, pipe events...}`;
//! on a pipe event it completes the previous overlapped write and
//! disconnects, issues the next overlapped write if the instance was
//! already primed, or queues a `ConnectNamedPipe` for the next reader.

use std::sync::Arc;
use std::thread;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_PENDING, ERROR_PIPE_CONNECTED, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{FlushFileBuffers, WriteFile};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_ACCESS_OUTBOUND,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use crate::publisher::Ring;
use crate::shutdown::Shutdown;

const FILE_FLAG_OVERLAPPED: u32 = 0x4000_0000;
/// Endpoints served by one worker thread.
const ENDPOINTS_PER_WORKER: usize = 20;
/// Pipe instances per endpoint, for reader overlap.
const INSTANCES_PER_ENDPOINT: usize = 2;

struct PipeInstance {
    handle: HANDLE,
    event: HANDLE,
    overlapped: Box<OVERLAPPED>,
    initialized: bool,
    connected: bool,
    /// Buffer pinned while an overlapped write is in flight.
    in_flight: Option<Arc<Vec<u8>>>,
}

unsafe impl Send for PipeInstance {}

/// All pipe instances for one ring, created before any input is read.
pub struct PipeEndpoints {
    instances: Vec<PipeInstance>,
    stop_event: HANDLE,
}

unsafe impl Send for PipeEndpoints {}
unsafe impl Sync for PipeEndpoints {}

fn wide_pipe_name(seg_name: &str, index: usize) -> Vec<u16> {
    format!("\\\\.\\pipe\\tsmemseg_{seg_name}{index:02}")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

impl PipeEndpoints {
    /// Create two overlapped instances per endpoint. Everything created
    /// so far is torn down again on failure.
    pub fn create(seg_name: &str, endpoint_count: usize) -> std::io::Result<Self> {
        let stop_event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if stop_event.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        let mut endpoints = Self {
            instances: Vec::new(),
            stop_event,
        };
        for endpoint in 0..endpoint_count {
            let name = wide_pipe_name(seg_name, endpoint);
            for _ in 0..INSTANCES_PER_ENDPOINT {
                let event = unsafe { CreateEventW(std::ptr::null(), 1, 1, std::ptr::null()) };
                if event.is_null() {
                    let err = std::io::Error::last_os_error();
                    endpoints.close_all();
                    return Err(err);
                }
                let handle = unsafe {
                    CreateNamedPipeW(
                        name.as_ptr(),
                        PIPE_ACCESS_OUTBOUND | FILE_FLAG_OVERLAPPED,
                        0,
                        INSTANCES_PER_ENDPOINT as u32,
                        48128,
                        0,
                        0,
                        std::ptr::null(),
                    )
                };
                if handle == INVALID_HANDLE_VALUE {
                    let err = std::io::Error::last_os_error();
                    unsafe { CloseHandle(event) };
                    endpoints.close_all();
                    return Err(err);
                }
                endpoints.instances.push(PipeInstance {
                    handle,
                    event,
                    overlapped: Box::new(unsafe { std::mem::zeroed() }),
                    initialized: false,
                    connected: false,
                    in_flight: None,
                });
            }
        }
        Ok(endpoints)
    }

    pub fn close_all(&mut self) {
        for instance in self.instances.drain(..).rev() {
            unsafe {
                if instance.handle != INVALID_HANDLE_VALUE {
                    CloseHandle(instance.handle);
                }
                CloseHandle(instance.event);
            }
        }
    }

    fn worker_count(&self) -> usize {
        let endpoints = self.instances.len() / INSTANCES_PER_ENDPOINT;
        endpoints.div_ceil(ENDPOINTS_PER_WORKER)
    }
}

/// A raw handle that may cross into a worker thread.
#[derive(Clone, Copy)]
struct SendHandle(HANDLE);

unsafe impl Send for SendHandle {}

/// Handle for waking the workers out of their event wait at shutdown.
pub struct StopEvent(HANDLE);

unsafe impl Send for StopEvent {}
unsafe impl Sync for StopEvent {}

impl StopEvent {
    pub fn signal(&self) {
        unsafe { SetEvent(self.0) };
    }
}

/// Spawn one worker per 20 endpoints. The workers own the instances.
pub fn spawn_workers(
    ring: Arc<Ring>,
    mut endpoints: PipeEndpoints,
    shutdown: Arc<Shutdown>,
) -> (Vec<thread::JoinHandle<()>>, StopEvent) {
    let stop_event = endpoints.stop_event;
    let worker_count = endpoints.worker_count();
    let mut handles = Vec::with_capacity(worker_count);
    let mut instances: Vec<PipeInstance> = endpoints.instances.drain(..).collect();
    let mut first_endpoint = 0usize;
    for _ in 0..worker_count {
        let take = (ENDPOINTS_PER_WORKER * INSTANCES_PER_ENDPOINT).min(instances.len());
        let chunk: Vec<PipeInstance> = instances.drain(..take).collect();
        let ring = ring.clone();
        let shutdown = shutdown.clone();
        let base = first_endpoint;
        let stop = SendHandle(stop_event);
        first_endpoint += take / INSTANCES_PER_ENDPOINT;
        handles.push(
            thread::Builder::new()
                .name("tsmemseg-publisher".into())
                .spawn(move || worker(ring, chunk, base, stop, shutdown))
                .expect("spawn publisher worker"),
        );
    }
    (handles, StopEvent(stop_event))
}

fn worker(
    ring: Arc<Ring>,
    mut instances: Vec<PipeInstance>,
    first_endpoint: usize,
    stop_event: SendHandle,
    shutdown: Arc<Shutdown>,
) {
    let mut events: Vec<HANDLE> = Vec::with_capacity(1 + instances.len());
    events.push(stop_event.0);
    events.extend(instances.iter().map(|p| p.event));

    loop {
        let result =
            unsafe { WaitForMultipleObjects(events.len() as u32, events.as_ptr(), 0, INFINITE) };
        let index = result.wrapping_sub(WAIT_OBJECT_0) as usize;
        if index == 0 || index >= events.len() || shutdown.is_signaled() {
            break;
        }
        ring.touch();

        let instance_index = index - 1;
        let endpoint = first_endpoint + instance_index / INSTANCES_PER_ENDPOINT;
        let instance = &mut instances[instance_index];

        if instance.connected {
            // Complete the asynchronous write.
            unsafe {
                FlushFileBuffers(instance.handle);
                DisconnectNamedPipe(instance.handle);
            }
            instance.connected = false;
            if instance.in_flight.take().is_some() {
                ring.end_read(endpoint);
            }
        } else if instance.initialized {
            // A reader connected: start the overlapped write.
            let buf = ring.begin_read(endpoint);
            instance.connected = true;
            *instance.overlapped = unsafe { std::mem::zeroed() };
            instance.overlapped.hEvent = instance.event;
            let ok = unsafe {
                WriteFile(
                    instance.handle,
                    buf.as_ptr(),
                    buf.len() as u32,
                    std::ptr::null_mut(),
                    &mut *instance.overlapped,
                )
            };
            if ok == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
                unsafe { DisconnectNamedPipe(instance.handle) };
                instance.connected = false;
                ring.end_read(endpoint);
            } else {
                instance.in_flight = Some(buf);
            }
        }

        if !instance.connected {
            // Queue the next reader.
            *instance.overlapped = unsafe { std::mem::zeroed() };
            instance.overlapped.hEvent = instance.event;
            let ok = unsafe { ConnectNamedPipe(instance.handle, &mut *instance.overlapped) };
            if ok == 0 {
                match unsafe { GetLastError() } {
                    ERROR_PIPE_CONNECTED => unsafe {
                        SetEvent(instance.event);
                    },
                    ERROR_IO_PENDING => {}
                    _ => unsafe {
                        // Tear the instance down; creation is retried on
                        // the next turn of this event.
                        CloseHandle(instance.handle);
                        instance.handle = INVALID_HANDLE_VALUE;
                        ResetEvent(instance.event);
                    },
                }
            }
        }
        instance.initialized = true;
    }

    // Cancel outstanding overlapped I/O and wait for completion.
    for (i, instance) in instances.iter_mut().enumerate() {
        if instance.handle != INVALID_HANDLE_VALUE && instance.initialized {
            unsafe {
                if CancelIo(instance.handle) != 0 {
                    WaitForSingleObject(instance.event, INFINITE);
                }
            }
        }
        if instance.in_flight.take().is_some() {
            ring.end_read(first_endpoint + i / INSTANCES_PER_ENDPOINT);
        }
        unsafe {
            if instance.handle != INVALID_HANDLE_VALUE {
                CloseHandle(instance.handle);
            }
            CloseHandle(instance.event);
        }
    }
}
