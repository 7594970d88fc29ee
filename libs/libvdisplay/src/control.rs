//! Host control calls
//!
//! Small requests on the video channel: ring enable/disable, flush and
//! submit doorbells, screen description, and the command-ring control
//! requests (enable, 3D client connect/disconnect, resize) that go through
//! the synchronous submission helper.

use crate::adapter::GuestContext;
use crate::error::{status, Error, Result};
use crate::host::{vbva_kind, EnableFlags};
use crate::submit::CommandBuffer;

/// Command-ring control request types
pub mod ctl_type {
    /// Enable or disable the command ring
    pub const ENABLE: u32 = 1;
    /// 3D command client control
    pub const CLIENT: u32 = 2;
    /// Screen resize
    pub const RESIZE: u32 = 3;
}

/// 3D command client control operations
pub mod client_op {
    /// Register a client
    pub const CONNECT: u32 = 1;
    /// Unregister a client
    pub const DISCONNECT: u32 = 2;
}

/// Flush request flag: the guest overflowed its ring
pub const FLUSH_GUEST_BUFFER_OVERFLOW: u32 = 1;

bitflags::bitflags! {
    /// Screen state flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ScreenFlags: u16 {
        /// Screen is in use
        const ACTIVE = 0x0001;
        /// Screen is turned off
        const DISABLED = 0x0002;
        /// Screen is blanked
        const BLANK = 0x0004;
    }
}

/// Geometry of one guest screen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScreenInfo {
    /// View holding the screen
    pub view_index: u32,
    /// X origin relative to the primary screen
    pub origin_x: i32,
    /// Y origin relative to the primary screen
    pub origin_y: i32,
    /// Framebuffer offset of the visible area
    pub start_offset: u32,
    /// Scanline size in bytes
    pub line_size: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Color depth
    pub bits_per_pixel: u16,
    /// State flags
    pub flags: ScreenFlags,
}

impl ScreenInfo {
    /// Encoded size
    pub const SIZE: usize = 32;

    /// Little-endian wire form
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0..4].copy_from_slice(&self.view_index.to_le_bytes());
        raw[4..8].copy_from_slice(&self.origin_x.to_le_bytes());
        raw[8..12].copy_from_slice(&self.origin_y.to_le_bytes());
        raw[12..16].copy_from_slice(&self.start_offset.to_le_bytes());
        raw[16..20].copy_from_slice(&self.line_size.to_le_bytes());
        raw[20..24].copy_from_slice(&self.width.to_le_bytes());
        raw[24..28].copy_from_slice(&self.height.to_le_bytes());
        raw[28..30].copy_from_slice(&self.bits_per_pixel.to_le_bytes());
        raw[30..32].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw
    }
}

fn enable_request(flags: EnableFlags, ring_offset: u32, screen: u32) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0..4].copy_from_slice(&flags.bits().to_le_bytes());
    raw[4..8].copy_from_slice(&ring_offset.to_le_bytes());
    raw[8..12].copy_from_slice(&status::VERR_NOT_SUPPORTED.to_le_bytes());
    raw[12..16].copy_from_slice(&screen.to_le_bytes());
    raw
}

/// Enable or disable the notification ring at `ring_offset`; returns the
/// host status
pub fn vbva_enable(
    ctx: &GuestContext,
    ring_offset: u32,
    screen: u32,
    flags: EnableFlags,
) -> Result<i32> {
    let request = enable_request(
        flags | EnableFlags::EXTENDED | EnableFlags::ABSOFFSET,
        ring_offset,
        screen,
    );
    let rc = ctx.call_host(vbva_kind::ENABLE, &request, |region, data| {
        region.read_i32(data + 8)
    })?;
    log::debug!("ring enable {:?} screen {}: rc={}", flags, screen, rc);
    Ok(rc)
}

/// Ask the host to drain the notification rings
pub fn vbva_flush(ctx: &GuestContext) -> Result<()> {
    ctx.stats().flush();
    ctx.call_host(vbva_kind::FLUSH, &0u32.to_le_bytes(), |_, _| Ok(()))
}

/// Report the geometry of a screen
pub fn describe_screen(ctx: &GuestContext, screen: &ScreenInfo) -> Result<()> {
    ctx.call_host(vbva_kind::INFO_SCREEN, &screen.encode(), |_, _| Ok(()))
}

/// Tell the host there is new work on the command ring
pub fn cmdvbva_submit(ctx: &GuestContext) -> Result<()> {
    ctx.stats().doorbell();
    ctx.call_host(vbva_kind::CMDVBVA_SUBMIT, &0u32.to_le_bytes(), |_, _| Ok(()))
}

/// Ask the host to drain the command ring
pub fn cmdvbva_flush(ctx: &GuestContext, overflow: bool) -> Result<()> {
    ctx.stats().flush();
    let flags = if overflow {
        FLUSH_GUEST_BUFFER_OVERFLOW
    } else {
        0
    };
    ctx.call_host(vbva_kind::CMDVBVA_FLUSH, &flags.to_le_bytes(), |_, _| Ok(()))
}

/// Control request header size: `{ type: u32, result: i32 }`
const CTL_HEADER_SIZE: u32 = 8;

fn ctl_call(ctx: &GuestContext, kind: u32, body: &[u8]) -> Result<CommandBuffer> {
    let buffer = ctx.alloc_command(CTL_HEADER_SIZE + body.len() as u32, vbva_kind::CMDVBVA_CTL)?;
    buffer.write(0, &kind.to_le_bytes())?;
    buffer.write(4, &status::VERR_NOT_IMPLEMENTED.to_le_bytes())?;
    buffer.write(CTL_HEADER_SIZE, body)?;

    ctx.submit_and_wait(&buffer)?;

    let rc = buffer.read_i32(4)?;
    if !status::succeeded(rc) {
        log::warn!("control request {} failed: rc={}", kind, rc);
        return Err(Error::HostRejected(rc));
    }
    Ok(buffer)
}

/// Enable or disable the command ring at `ring_offset`
pub fn ctl_enable(ctx: &GuestContext, ring_offset: u32, enable: bool) -> Result<()> {
    let flags = if enable {
        EnableFlags::ENABLE | EnableFlags::ABSOFFSET
    } else {
        EnableFlags::DISABLE | EnableFlags::ABSOFFSET
    };
    let request = enable_request(flags, ring_offset, 0);
    let buffer = ctl_call(ctx, ctl_type::ENABLE, &request[..12])?;

    let rc = buffer.read_i32(CTL_HEADER_SIZE + 8)?;
    if !status::succeeded(rc) {
        return Err(Error::HostRejected(rc));
    }
    Ok(())
}

/// Register a 3D command client; returns the host-assigned client id
pub fn connect_client(ctx: &GuestContext, major: u32, minor: u32, pid: u64) -> Result<u32> {
    let mut body = [0u8; 24];
    body[0..4].copy_from_slice(&client_op::CONNECT.to_le_bytes());
    body[8..12].copy_from_slice(&major.to_le_bytes());
    body[12..16].copy_from_slice(&minor.to_le_bytes());
    body[16..24].copy_from_slice(&pid.to_le_bytes());

    let buffer = ctl_call(ctx, ctl_type::CLIENT, &body)?;
    let client = buffer.read_u32(CTL_HEADER_SIZE + 4)?;
    log::debug!("3D client connected: id {}", client);
    Ok(client)
}

/// Unregister a 3D command client
pub fn disconnect_client(ctx: &GuestContext, client: u32) -> Result<()> {
    let mut body = [0u8; 8];
    body[0..4].copy_from_slice(&client_op::DISCONNECT.to_le_bytes());
    body[4..8].copy_from_slice(&client.to_le_bytes());
    ctl_call(ctx, ctl_type::CLIENT, &body)?;
    log::debug!("3D client {} disconnected", client);
    Ok(())
}

/// Resize a screen; `targets` is a bitmap of the outputs showing it
pub fn resize(ctx: &GuestContext, screen: &ScreenInfo, targets: u64) -> Result<()> {
    let mut body = [0u8; ScreenInfo::SIZE + 8];
    body[..ScreenInfo::SIZE].copy_from_slice(&screen.encode());
    body[ScreenInfo::SIZE..].copy_from_slice(&targets.to_le_bytes());
    ctl_call(ctx, ctl_type::RESIZE, &body)?;
    Ok(())
}
