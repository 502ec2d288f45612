//! Host functions imported by every module runtime.
//!
//! All of these are linked once per runtime. Functions that target a module's
//! memory operate on the calling instance's exports, so with one runtime per
//! module they always hit the right linear memory; the runtime's
//! current-module slot is still set at every invocation for the functions
//! that need to know who is calling (logging, RPC).

use std::io::Read;

use anyhow::{anyhow, Result};
use log::{debug, error, warn};
use rand::RngCore;
use wasmtime::{Caller, Extern, Linker, Memory, TypedFunc};

use crate::util::configuration::REMOTE_FUNCTIONS;
use crate::util::constants::{ALLOC_EXPORT_NAME, MEMORY_EXPORT_NAME, RPC_CALL_TIMEOUT};
use crate::wasm::runtime::{HostState, PROCESS_START};

/// Maximum length scanned for a NUL terminator by `sys.println`.
const MAX_CSTR_LEN: usize = 4096;

/// Register the whole host-function catalogue on the given linker.
pub fn link_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    // sys
    linker.func_wrap("sys", "millis", |_: Caller<'_, HostState>| -> i32 {
        PROCESS_START.elapsed().as_millis() as i32
    })?;
    linker.func_wrap("sys", "delay", |_: Caller<'_, HostState>, ms: i32| {
        std::thread::sleep(std::time::Duration::from_millis(ms.max(0) as u64));
    })?;
    linker.func_wrap(
        "sys",
        "print",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<()> {
            let memory = caller_memory(&mut caller)?;
            let mut buf = vec![0u8; len.max(0) as usize];
            memory.read(&caller, ptr as usize, &mut buf)?;
            print!("{}", String::from_utf8_lossy(&buf));
            Ok(())
        },
    )?;
    linker.func_wrap(
        "sys",
        "println",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> Result<()> {
            let memory = caller_memory(&mut caller)?;
            let message = read_cstr(&mut caller, &memory, ptr as usize)?;
            println!("{}", message);
            Ok(())
        },
    )?;
    linker.func_wrap("sys", "printInt", |_: Caller<'_, HostState>, n: i32| {
        print!("{}", n);
    })?;

    // communication
    linker.func_wrap(
        "communication",
        "rpcCall",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         data_ptr: i32,
         data_len: i32|
         -> Result<()> {
            let memory = caller_memory(&mut caller)?;
            let mut name_buf = vec![0u8; name_len.max(0) as usize];
            memory.read(&caller, name_ptr as usize, &mut name_buf)?;
            let func_name = String::from_utf8_lossy(&name_buf).to_string();
            let mut data = vec![0u8; data_len.max(0) as usize];
            memory.read(&caller, data_ptr as usize, &mut data)?;
            rpc_call(&func_name, data, caller.data().current_module.as_deref());
            Ok(())
        },
    )?;

    // camera
    linker.func_wrap(
        "camera",
        "takeImageDynamicSize",
        |mut caller: Caller<'_, HostState>, out_ptr_ptr: i32, out_size_ptr: i32| -> Result<()> {
            let image = capture_image()?;
            let data_len = image.len();
            let data_ptr = alloc_in_caller(&mut caller, data_len as i32)?;

            let memory = caller_memory(&mut caller)?;
            memory.write(&mut caller, data_ptr as usize, &image)?;
            memory.write(
                &mut caller,
                out_ptr_ptr as usize,
                &(data_ptr as u32).to_le_bytes(),
            )?;
            memory.write(
                &mut caller,
                out_size_ptr as usize,
                &(data_len as u32).to_le_bytes(),
            )?;
            Ok(())
        },
    )?;
    linker.func_wrap(
        "camera",
        "takeImageStaticSize",
        |mut caller: Caller<'_, HostState>, out_ptr: i32, size_ptr: i32| -> Result<()> {
            let memory = caller_memory(&mut caller)?;
            let mut size_bytes = [0u8; 4];
            memory.read(&caller, size_ptr as usize, &mut size_bytes)?;
            let expected_size = u32::from_le_bytes(size_bytes) as usize;

            let mut image = capture_image()?;
            image.truncate(expected_size);
            memory.write(&mut caller, out_ptr as usize, &image)?;
            Ok(())
        },
    )?;

    // dht
    linker.func_wrap("dht", "getTemperature", |_: Caller<'_, HostState>| -> f32 {
        read_temperature()
    })?;
    linker.func_wrap("dht", "getHumidity", |_: Caller<'_, HostState>| -> f32 {
        read_humidity()
    })?;

    // Shadows the WASI-provided implementation so modules observe the same
    // randomness source whichever import they were compiled against.
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "random_get",
        |mut caller: Caller<'_, HostState>, buf_ptr: i32, size: i32| -> Result<i32> {
            let mut buf = vec![0u8; size.max(0) as usize];
            rand::rng().fill_bytes(&mut buf);
            let memory = caller_memory(&mut caller)?;
            memory.write(&mut caller, buf_ptr as usize, &buf)?;
            Ok(0)
        },
    )?;

    Ok(())
}

/// The calling instance's linear memory export.
fn caller_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
    match caller.get_export(MEMORY_EXPORT_NAME) {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(anyhow!(
            "calling module does not export a linear memory named \"{}\"",
            MEMORY_EXPORT_NAME
        )),
    }
}

/// Allocate `len` bytes inside the calling module via its exported allocator.
fn alloc_in_caller(caller: &mut Caller<'_, HostState>, len: i32) -> Result<u32> {
    let alloc: TypedFunc<i32, i32> = match caller.get_export(ALLOC_EXPORT_NAME) {
        Some(Extern::Func(func)) => func.typed(&mut *caller)?,
        _ => {
            return Err(anyhow!(
                "calling module does not export an allocator named \"{}\"",
                ALLOC_EXPORT_NAME
            ))
        }
    };
    let ptr = alloc.call(&mut *caller, len)?;
    if ptr < 0 {
        return Err(anyhow!("unable to allocate {} bytes", len));
    }
    Ok(ptr as u32)
}

/// Read a NUL-terminated string from the calling module's memory.
fn read_cstr(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    address: usize,
) -> Result<String> {
    let data = memory.data(&*caller);
    let end = (address + MAX_CSTR_LEN).min(data.len());
    if address >= data.len() {
        return Err(anyhow!("string pointer {} out of bounds", address));
    }
    let slice = &data[address..end];
    let len = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    Ok(String::from_utf8_lossy(&slice[..len]).to_string())
}

/// POST `data` as a file named `img` to the host registered for `func_name`
/// in the remote-functions table.
fn rpc_call(func_name: &str, data: Vec<u8>, current_module: Option<&str>) {
    debug!(
        "rpcCall '{}' from module {:?} with {} bytes",
        func_name,
        current_module,
        data.len()
    );
    let Some(func) = REMOTE_FUNCTIONS.get(func_name) else {
        error!("No remote function registered under '{}'", func_name);
        return;
    };

    let form = reqwest::blocking::multipart::Form::new().part(
        "img",
        reqwest::blocking::multipart::Part::bytes(data).file_name("img"),
    );
    let client = match reqwest::blocking::Client::builder()
        .timeout(RPC_CALL_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build rpcCall client: {}", e);
            return;
        }
    };
    match client.post(&func.host).multipart(form).send() {
        Ok(response) => debug!("rpcCall to {} returned {}", func.host, response.status()),
        Err(e) => error!("rpcCall to {} failed: {}", func.host, e),
    }
}

/// Capture one JPEG frame.
///
/// No camera driver is bundled; the image is read from the file named by
/// `CAMERA_IMAGE_PATH` (default `./fakeWebcam.jpg`), standing in for the
/// device camera while preserving the import's memory protocol.
pub fn capture_image() -> Result<Vec<u8>> {
    let path = std::env::var("CAMERA_IMAGE_PATH").unwrap_or_else(|_| "./fakeWebcam.jpg".into());
    let mut file = std::fs::File::open(&path)
        .map_err(|e| anyhow!("no camera image available at '{}': {}", path, e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

fn read_temperature() -> f32 {
    // No DHT22 wired up on this build.
    warn!("Temperature requested but no sensor is attached, reporting 0.0");
    0.0
}

fn read_humidity() -> f32 {
    warn!("Humidity requested but no sensor is attached, reporting 0.0");
    0.0
}
