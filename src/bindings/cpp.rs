use crate::acquisition::EpochStore;
use crate::config::AcquisitionConfig;

use std::os::raw::c_void;
use std::sync::Arc;

/// Status codes returned across the C boundary.
pub const ESC_OK: i32 = 0;
pub const ESC_ERROR: i32 = -1;
pub const ESC_EMPTY: i32 = 1;

/// Most buffers (recording channels plus trigger) one callback may pass.
pub const ESC_MAX_BUFFERS: usize = 64;

/// Handle owned by the native driver. The driver thread and the control
/// thread use it concurrently, so entry points only ever borrow it shared.
pub struct EpochStoreFFI {
    store: Arc<EpochStore>,
}

impl EpochStoreFFI {
    pub fn new(store: Arc<EpochStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EpochStore> {
        &self.store
    }
}

unsafe fn handle<'a>(ptr: *mut c_void) -> Option<&'a EpochStoreFFI> {
    (ptr as *const EpochStoreFFI).as_ref()
}

#[no_mangle]
pub extern "C" fn esc_create(
    sample_rate: f64,
    num_channels: usize,
    epoch_samples: usize,
    retention: usize,
) -> *mut c_void {
    let config = AcquisitionConfig {
        sample_rate,
        num_channels,
        epoch_samples,
        retention,
        ..AcquisitionConfig::default()
    };
    match EpochStore::new(&config) {
        Ok(store) => Box::into_raw(Box::new(EpochStoreFFI::new(Arc::new(store)))) as *mut c_void,
        Err(e) => {
            log::error!("esc_create: {}", e);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "C" fn esc_delete(store_ptr: *mut c_void) {
    if !store_ptr.is_null() {
        unsafe {
            drop(Box::from_raw(store_ptr as *mut EpochStoreFFI));
        }
    }
}

#[no_mangle]
pub extern "C" fn esc_initialize(
    store_ptr: *mut c_void,
    num_channels: usize,
    epoch_samples: usize,
) -> i32 {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return ESC_ERROR;
    };
    match ffi.store.initialize(num_channels, epoch_samples) {
        Ok(()) => ESC_OK,
        Err(e) => {
            log::error!("esc_initialize: {}", e);
            ESC_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn esc_set_threshold(store_ptr: *mut c_void, channel: usize, value: f32) -> i32 {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return ESC_ERROR;
    };
    match ffi.store.set_threshold(channel, value) {
        Ok(()) => ESC_OK,
        Err(_) => ESC_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn esc_get_threshold(store_ptr: *mut c_void, channel: usize) -> f32 {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return f32::NAN;
    };
    ffi.store.threshold(channel).unwrap_or(f32::NAN)
}

/// Audio callback entry. `buffers` points to `num_buffers` channel pointers
/// (at most [`ESC_MAX_BUFFERS`]), each holding `length` samples.
#[no_mangle]
pub extern "C" fn esc_sound_proc(
    store_ptr: *mut c_void,
    buffers: *const *const f32,
    num_buffers: usize,
    length: usize,
    trigger_test_mode: bool,
) {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return;
    };
    if buffers.is_null() {
        return;
    }
    if num_buffers > ESC_MAX_BUFFERS {
        return;
    }
    let channel_ptrs = unsafe { std::slice::from_raw_parts(buffers, num_buffers) };
    if channel_ptrs.iter().any(|p| p.is_null()) {
        return;
    }

    // Views live on the stack for this call only
    let empty: &[f32] = &[];
    let mut views = [empty; ESC_MAX_BUFFERS];
    for (view, &ptr) in views.iter_mut().zip(channel_ptrs) {
        *view = unsafe { std::slice::from_raw_parts(ptr, length) };
    }
    ffi.store.sound_proc(&views[..num_buffers], trigger_test_mode);
}

/// Copies the next completed epoch into `out` (`num_channels * epoch_samples`
/// floats, channel-major). Returns `ESC_EMPTY` when nothing is pending.
#[no_mangle]
pub extern "C" fn esc_pop(
    store_ptr: *mut c_void,
    out: *mut f32,
    out_len: usize,
    index: *mut usize,
    is_last: *mut bool,
) -> i32 {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return ESC_ERROR;
    };
    let Some((epoch, last)) = ffi.store.pop() else {
        return ESC_EMPTY;
    };
    let Some(data) = epoch.data() else {
        return ESC_ERROR;
    };
    let samples = data.as_slice();
    if out.is_null() || out_len < samples.len() {
        return ESC_ERROR;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(samples.as_ptr(), out, samples.len());
        if !index.is_null() {
            *index = epoch.index;
        }
        if !is_last.is_null() {
            *is_last = last;
        }
    }
    ESC_OK
}

/// Polls the callback status: 0 when healthy, a negative code per fault.
#[no_mangle]
pub extern "C" fn esc_status(store_ptr: *mut c_void) -> i32 {
    let Some(ffi) = (unsafe { handle(store_ptr) }) else {
        return ESC_ERROR;
    };
    let status = ffi.store.status();
    match (status.trigger_fault, status.write_failed, status.queue_overrun) {
        (Some(_), _, _) => -2,
        (None, true, _) => -3,
        (None, false, true) => -4,
        _ => ESC_OK,
    }
}
