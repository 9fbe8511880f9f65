use fiberio_core::syscall::raw::IoctlRequest;
use libc::{c_int, c_ulong, c_void, sockaddr, socklen_t};

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    fiberio_core::syscall::socket(domain, ty, protocol)
}

#[no_mangle]
pub extern "C" fn connect(socket: c_int, address: *const sockaddr, len: socklen_t) -> c_int {
    fiberio_core::syscall::connect(socket, address, len)
}

#[no_mangle]
pub extern "C" fn accept(
    socket: c_int,
    address: *mut sockaddr,
    address_len: *mut socklen_t,
) -> c_int {
    fiberio_core::syscall::accept(socket, address, address_len)
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    fiberio_core::syscall::close(fd)
}

// variadic in C, the third argument is read as a word either way
#[no_mangle]
pub extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    fiberio_core::syscall::fcntl(fd, cmd, arg)
}

#[no_mangle]
pub extern "C" fn ioctl(fd: c_int, request: IoctlRequest, arg: *mut c_void) -> c_int {
    fiberio_core::syscall::ioctl(fd, request, arg)
}

#[no_mangle]
pub extern "C" fn setsockopt(
    socket: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    option_len: socklen_t,
) -> c_int {
    fiberio_core::syscall::setsockopt(socket, level, name, value, option_len)
}
