use crate::cmd::{PicprogError, Result};
use crate::config::Config;
use crate::transport::Transport;
use crate::{PICPROG_INTERFACE_CLASS, PICPROG_VID};

use rusb::{Device, DeviceHandle, Direction, TransferType, UsbContext};

/// Configuration, interface, alternate setting and endpoint address.
type EndpointInfo = (u8, u8, u8, u8);

/// Bulk IN/OUT connection to the programmer's vendor interface.
#[derive(Debug)]
pub struct PicprogConnection<T: UsbContext> {
    _context: T,
    _device: Device<T>,
    handle: DeviceHandle<T>,

    iface: u8,
    in_addr: u8,
    out_addr: u8,

    has_kernel_driver: bool,
    config: Config,
}

impl<T: UsbContext> Drop for PicprogConnection<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            log::warn!("Could not release interface {}: {}", self.iface, e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.iface) {
                log::warn!("Could not reattach kernel driver: {}", e);
            }
        }
    }
}
impl<T: UsbContext> PicprogConnection<T> {
    /// Opens the programmer. With `vidpid` the device with exactly those IDs
    /// is used, otherwise the first Microchip device with a vendor specific
    /// bulk interface.
    pub fn new(ctx: T, vidpid: impl Into<Option<(u16, u16)>>, config: Config) -> Result<Self> {
        let vidpid = vidpid.into();
        let (device, handle, (cfg, iface, setting, in_addr), out_addr) =
            Self::open_device(&ctx, vidpid)?;

        let has_kernel_driver = match handle.kernel_driver_active(iface) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(iface)
                    .map_err(PicprogError::UsbDetachKernelDriverFailure)?;
                true
            }
            _ => false,
        };

        if let Err(e) = handle.set_active_configuration(cfg) {
            log::debug!("Could not set USB active configuration: {}", e);
        }

        handle
            .claim_interface(iface)
            .map_err(PicprogError::UsbClaimInterfaceFailure)?;
        handle
            .set_alternate_setting(iface, setting)
            .map_err(PicprogError::UsbSetAltSettingFailure)?;

        log::debug!(
            "Claimed interface {} (IN {:02x}, OUT {:02x})",
            iface,
            in_addr,
            out_addr
        );

        Ok(PicprogConnection {
            _context: ctx,
            _device: device,
            handle,

            iface,
            in_addr,
            out_addr,

            has_kernel_driver,
            config,
        })
    }

    #[allow(clippy::type_complexity)]
    fn open_device(
        ctx: &T,
        vidpid: Option<(u16, u16)>,
    ) -> Result<(Device<T>, DeviceHandle<T>, EndpointInfo, u8)> {
        let devices = ctx.devices().map_err(PicprogError::UsbListFailure)?;

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };

            let wanted = match vidpid {
                Some((vid, pid)) => desc.vendor_id() == vid && desc.product_id() == pid,
                None => desc.vendor_id() == PICPROG_VID,
            };
            if !wanted {
                continue;
            }

            let e_in = Self::get_endpoint(&device, Direction::In);
            let e_out = Self::get_endpoint(&device, Direction::Out);
            let (e_in, e_out) = match (e_in, e_out) {
                (Some(e_in), Some(e_out)) => (e_in, e_out),
                // An explicitly requested device has to be the programmer.
                _ if vidpid.is_some() => return Err(PicprogError::UsbEndpointsNotFound),
                _ => continue,
            };

            let (cfg, iface, setting, _) = e_in;
            let (out_cfg, out_iface, out_setting, out_addr) = e_out;
            if cfg != out_cfg || iface != out_iface || setting != out_setting {
                return Err(PicprogError::UsbEndpointsUnexpected);
            }

            log::info!(
                "Found programmer {:04x}:{:04x} on bus {} address {}",
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            );
            let handle = device.open().map_err(PicprogError::UsbOpenFailure)?;
            return Ok((device, handle, e_in, out_addr));
        }

        Err(PicprogError::UsbDeviceNotFound)
    }

    fn get_endpoint(device: &Device<T>, direction: Direction) -> Option<EndpointInfo> {
        let desc = device.device_descriptor().ok()?;
        for n in 0..desc.num_configurations() {
            let config_desc = match device.config_descriptor(n) {
                Ok(c) => c,
                Err(_) => continue,
            };

            for iface in config_desc.interfaces() {
                for iface_desc in iface.descriptors() {
                    if iface_desc.class_code() != PICPROG_INTERFACE_CLASS {
                        continue;
                    }

                    for endpoint_desc in iface_desc.endpoint_descriptors() {
                        if endpoint_desc.direction() == direction
                            && endpoint_desc.transfer_type() == TransferType::Bulk
                        {
                            return Some((
                                config_desc.number(),
                                iface_desc.interface_number(),
                                iface_desc.setting_number(),
                                endpoint_desc.address(),
                            ));
                        }
                    }
                }
            }
        }

        None
    }
}

impl<T: UsbContext> Transport for PicprogConnection<T> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let len = self
            .handle
            .write_bulk(self.out_addr, data, self.config.write_timeout)
            .map_err(PicprogError::UsbWriteBulkFailure)?;

        if len != data.len() {
            return Err(PicprogError::UsbWriteBulkMismatch {
                written: len,
                expected: data.len(),
            });
        }

        Ok(())
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; max_len];
        match self
            .handle
            .read_bulk(self.in_addr, &mut buf, self.config.read_timeout)
        {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(PicprogError::UsbReadBulkFailure(e)),
        }
    }
}
