use libc::{c_int, c_uint, timespec};

#[no_mangle]
pub extern "C" fn sleep(secs: c_uint) -> c_uint {
    fiberio_core::syscall::sleep(secs)
}

#[no_mangle]
pub extern "C" fn usleep(microseconds: c_uint) -> c_int {
    fiberio_core::syscall::usleep(microseconds)
}

#[no_mangle]
pub extern "C" fn nanosleep(rqtp: *const timespec, rmtp: *mut timespec) -> c_int {
    fiberio_core::syscall::nanosleep(rqtp, rmtp)
}
