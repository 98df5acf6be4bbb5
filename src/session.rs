//! Optional PAM session handling.
//!
//! When `open_user_sessions` is enabled, a session is opened for the
//! target account before the identity switch so the work lands in the
//! account's cgroup slice, and closed again afterwards. libpam is loaded
//! at runtime with dlopen so hosts without PAM simply skip sessions; PAM
//! errors are logged but never abort the request, matching the usual
//! best-effort session semantics.

use std::ffi::{c_char, c_int, c_void, CString};
use std::ptr;

use tracing::{debug, warn};

const PAM_SUCCESS: c_int = 0;

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

type ConvFn = extern "C" fn(
    c_int,
    *mut *const PamMessage,
    *mut *mut PamResponse,
    *mut c_void,
) -> c_int;

#[repr(C)]
struct PamConv {
    conv: ConvFn,
    appdata_ptr: *mut c_void,
}

// session open/close should never prompt; answer with empty responses
extern "C" fn conversation(
    num_msg: c_int,
    _msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    _appdata: *mut c_void,
) -> c_int {
    unsafe {
        *resp = libc::calloc(num_msg as usize, std::mem::size_of::<PamResponse>())
            as *mut PamResponse;
    }
    PAM_SUCCESS
}

type PamStartFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *const PamConv, *mut *mut c_void) -> c_int;
type PamSessionFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type PamEndFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type PamStrerrorFn = unsafe extern "C" fn(*mut c_void, c_int) -> *const c_char;

struct PamLib {
    start: PamStartFn,
    open_session: PamSessionFn,
    close_session: PamSessionFn,
    end: PamEndFn,
    strerror: PamStrerrorFn,
}

impl PamLib {
    fn load() -> Option<Self> {
        unsafe {
            let handle = libc::dlopen(c"libpam.so.0".as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
            if handle.is_null() {
                return None;
            }
            let sym = |name: &std::ffi::CStr| {
                let p = libc::dlsym(handle, name.as_ptr());
                if p.is_null() {
                    None
                } else {
                    Some(p)
                }
            };
            Some(Self {
                start: std::mem::transmute::<*mut c_void, PamStartFn>(sym(c"pam_start")?),
                open_session: std::mem::transmute::<*mut c_void, PamSessionFn>(sym(
                    c"pam_open_session",
                )?),
                close_session: std::mem::transmute::<*mut c_void, PamSessionFn>(sym(
                    c"pam_close_session",
                )?),
                end: std::mem::transmute::<*mut c_void, PamEndFn>(sym(c"pam_end")?),
                strerror: std::mem::transmute::<*mut c_void, PamStrerrorFn>(sym(c"pam_strerror")?),
            })
        }
    }
}

/// A PAM session scope. At most one session is open at a time; closing is
/// idempotent and guaranteed by the dispatcher on every exit path.
pub struct PamSession {
    lib: Option<PamLib>,
    module: CString,
    conv: PamConv,
    handle: *mut c_void,
}

impl PamSession {
    pub fn new(module_name: &str) -> Self {
        let lib = PamLib::load();
        if lib.is_none() {
            warn!("libpam not available, user sessions will not be opened");
        }
        Self {
            lib,
            module: CString::new(module_name).unwrap_or_else(|_| c"unicore-tsi".into()),
            conv: PamConv {
                conv: conversation,
                appdata_ptr: ptr::null_mut(),
            },
            handle: ptr::null_mut(),
        }
    }

    fn check(&self, call: &str, code: c_int) {
        if code != PAM_SUCCESS {
            let text = self
                .lib
                .as_ref()
                .map(|lib| unsafe {
                    let p = (lib.strerror)(self.handle, code);
                    if p.is_null() {
                        String::new()
                    } else {
                        std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned()
                    }
                })
                .unwrap_or_default();
            debug!("error {code} invoking '{call}': {text}");
        }
    }

    pub fn open_session(&mut self, user: &str) {
        let Some(lib) = &self.lib else {
            return;
        };
        let Ok(user) = CString::new(user) else {
            warn!("cannot open PAM session, bad user name");
            return;
        };
        unsafe {
            let code = (lib.start)(
                self.module.as_ptr(),
                user.as_ptr(),
                &self.conv,
                &mut self.handle,
            );
            self.check("pam_start", code);
            if code != PAM_SUCCESS {
                self.handle = ptr::null_mut();
                return;
            }
            let code = (lib.open_session)(self.handle, 0);
            self.check("pam_open_session", code);
        }
    }

    pub fn close_session(&mut self) {
        let Some(lib) = &self.lib else {
            return;
        };
        if self.handle.is_null() {
            return;
        }
        unsafe {
            let code = (lib.close_session)(self.handle, 0);
            self.check("pam_close_session", code);
            let code = (lib.end)(self.handle, 0);
            self.check("pam_end", code);
        }
        self.handle = ptr::null_mut();
    }
}

impl Drop for PamSession {
    fn drop(&mut self) {
        self.close_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_without_open_is_harmless() {
        let mut session = PamSession::new("unicore-tsi");
        session.close_session();
        session.close_session();
    }
}
