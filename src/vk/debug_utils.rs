//! Validation-layer debug callback (spec §2.1 Logging): routes
//! `VK_EXT_debug_utils` messages through the `log` facade. Adapted directly
//! from the teacher's `debug_utils_ext.rs`.

use ash::{extensions::ext::DebugUtils, vk, Entry, Instance};
use log::{debug, error, warn};
use static_assertions::assert_impl_all;
use std::{
  ffi::CStr,
  os::raw::c_void,
  pin::Pin,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

/// Debug callback plumbing enabled in validation-layer builds. Tracks
/// message counts (useful for test assertions that no errors were logged)
/// and forwards every message to `log`.
pub struct DebugUtilsAndMessenger {
  pub debug_utils: DebugUtils,
  pub messenger: vk::DebugUtilsMessengerEXT,
  pub debug_user_data: Pin<Arc<DebugUserData>>,
}

impl DebugUtilsAndMessenger {
  pub fn new(
    entry: &Entry, instance: &Instance, severity_flags: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_flags: vk::DebugUtilsMessageTypeFlagsEXT, debug_user_data: Option<Pin<Arc<DebugUserData>>>,
  ) -> Self {
    let debug_user_data = debug_user_data.unwrap_or_else(|| Arc::pin(DebugUserData::new()));
    let debug_user_data_ptr =
      unsafe { Arc::into_raw(Pin::into_inner_unchecked(debug_user_data.clone())) as *mut c_void };

    let debug_utils = DebugUtils::new(entry, instance);
    let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
      .message_severity(severity_flags)
      .message_type(type_flags)
      .pfn_user_callback(Some(Self::debug_callback))
      .user_data(debug_user_data_ptr)
      .build();
    let messenger = unsafe {
      debug_utils
        .create_debug_utils_messenger(&messenger_ci, None)
        .expect("failed to create debug utils messenger")
    };

    DebugUtilsAndMessenger {
      debug_utils,
      messenger,
      debug_user_data,
    }
  }

  /// Invariant: `p_user_data` is always a `DebugUserData` pointer set up by
  /// `new` above.
  pub unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT, _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT, p_user_data: *mut c_void,
  ) -> u32 {
    if !p_user_data.is_null() {
      let user_data = &*(p_user_data as *const DebugUserData);
      match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
          user_data.error_count.fetch_add(1, Ordering::SeqCst);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
          user_data.warning_count.fetch_add(1, Ordering::SeqCst);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
          user_data.info_count.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
      }
    }

    let message = CStr::from_ptr((*p_callback_data).p_message).to_str().unwrap_or("<non-utf8 message>");
    match message_severity {
      vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("validation error: {}", message),
      vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("validation warning: {}", message),
      vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!("validation info: {}", message),
      vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => debug!("validation verbose: {}", message),
      _ => {}
    }

    vk::FALSE
  }
}

assert_impl_all!(DebugUserData: Sync);
#[derive(Default)]
pub struct DebugUserData {
  info_count: AtomicUsize,
  warning_count: AtomicUsize,
  error_count: AtomicUsize,
}

impl DebugUserData {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get_error_counts(&self) -> DebugUserDataCopy {
    DebugUserDataCopy {
      info_count: self.info_count.load(Ordering::SeqCst),
      warning_count: self.warning_count.load(Ordering::SeqCst),
      error_count: self.error_count.load(Ordering::SeqCst),
    }
  }
}

#[derive(Debug)]
pub struct DebugUserDataCopy {
  pub info_count: usize,
  pub warning_count: usize,
  pub error_count: usize,
}
