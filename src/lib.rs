//! I2C driver for the MPL3115A2 pressure, altitude and temperature sensor.
//!
//! The sensor lives at the fixed I2C address 0x60. Every reading is taken in
//! one-shot mode: the driver triggers a single conversion, waits for the
//! device to report fresh data and converts the raw registers into degrees
//! Celsius, pascals or metres.
//!
//! ```rust, ignore
//! use mpl3115a2::*;
//!
//! let mut sensor = Mpl3115a2::new(&mut i2c, delay).expect("Failed to initialise sensor");
//! let temp = sensor.read_temperature().unwrap();
//! let pressure = sensor.read_pressure().unwrap();
//! let altitude = sensor.read_altitude().unwrap();
//! ```
//!
//! Altitude is derived by the device from the sea level pressure reference,
//! which can be set for the local weather:
//!
//! ```rust, ignore
//! sensor.set_sea_pressure(102_100.0).unwrap();
//! sensor.set_altitude_offset(-3).unwrap();
//! ```
//!
//! Poll loops are bounded. Use [Config] to change the interval between
//! polls or the number of polls before a read gives up with [Error::Timeout].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![cfg_attr(not(test), no_std)]

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use log::{debug, error, trace, warn};

/// I2C address of the MPL3115A2.
pub const ADDR: u8 = 0x60;
/// Expected content of the WHO_AM_I register.
pub const DEVICE_ID: u8 = 0xC4;

const STATUS: u8 = 0x00;
const OUT_P_MSB: u8 = 0x01;
const OUT_T_MSB: u8 = 0x04;
const WHO_AM_I: u8 = 0x0C;
const PT_DATA_CFG: u8 = 0x13;
const BAR_IN_MSB: u8 = 0x14;
const CTRL_REG1: u8 = 0x26;
const OFF_H: u8 = 0x2D;

const CTRL_REG1_OST: u8 = 1 << 1;
const CTRL_REG1_RST: u8 = 1 << 2;
const CTRL_REG1_OS_MASK: u8 = 0b111 << 3;
const CTRL_REG1_ALT: u8 = 1 << 7;

const STATUS_TDR: u8 = 1 << 1;
const STATUS_PDR: u8 = 1 << 2;
const STATUS_PTDR: u8 = 1 << 3;

const PT_DATA_CFG_TDEFE: u8 = 1 << 0;
const PT_DATA_CFG_PDEFE: u8 = 1 << 1;
const PT_DATA_CFG_DREM: u8 = 1 << 2;

/// Largest sea level pressure the BAR_IN registers can hold, in pascals.
pub const MAX_SEA_PRESSURE: f32 = u16::MAX as f32 * 2.0;

/// Acquisition mode of the pressure channel.
///
/// The OUT_P registers hold pressure in [Mode::Barometer] and altitude in
/// [Mode::Altimeter]. Temperature is available in either mode. The driver
/// switches modes on demand, so calling [Mpl3115a2::set_mode] is only
/// needed to pre-select a mode ahead of time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// OUT_P holds pressure in pascals.
    Barometer,
    /// OUT_P holds altitude in metres. This is the mode after initialisation.
    Altimeter,
}

impl Mode {
    fn apply(self, ctrl: u8) -> u8 {
        let cleared = ctrl & !CTRL_REG1_ALT;
        match self {
            Mode::Barometer => cleared,
            Mode::Altimeter => cleared | CTRL_REG1_ALT,
        }
    }
}

/// Number of internal samples averaged per reading.
///
/// Higher ratios reduce noise at the cost of conversion time, from about
/// 6 ms at [Oversampling::One] to about 512 ms at
/// [Oversampling::OneTwentyEight].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Oversampling {
    /// One sample per reading.
    One = 0b000,
    /// Two samples per reading.
    Two = 0b001,
    /// Four samples per reading.
    Four = 0b010,
    /// Eight samples per reading.
    Eight = 0b011,
    /// Sixteen samples per reading.
    Sixteen = 0b100,
    /// Thirty-two samples per reading.
    ThirtyTwo = 0b101,
    /// Sixty-four samples per reading.
    SixtyFour = 0b110,
    /// One hundred twenty-eight samples per reading. Used by initialisation.
    OneTwentyEight = 0b111,
}

impl Oversampling {
    fn bits(self) -> u8 {
        (self as u8) << 3
    }
}

/// Timing of the driver's poll loops.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    /// Delay between two reads of a register that is not ready yet.
    pub poll_interval_ms: u32,
    /// Number of reads before a poll loop gives up with [Error::Timeout].
    /// Zero is treated as one.
    pub max_polls: u32,
}

impl Default for Config {
    /// 10 ms between polls and 100 polls, enough for a conversion at the
    /// highest oversampling ratio.
    fn default() -> Self {
        Config {
            poll_interval_ms: 10,
            max_polls: 100,
        }
    }
}

/// Errors returned by the driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// An I2C transaction failed.
    Bus(E),
    /// WHO_AM_I did not contain [DEVICE_ID]. Carries the value that was read.
    UnexpectedDevice(u8),
    /// A poll loop used up [Config::max_polls] without seeing the expected bit.
    Timeout,
    /// A calibration value cannot be represented by its register.
    InvalidArgument,
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "i2c bus error: {:?}", e),
            Error::UnexpectedDevice(id) => {
                write!(f, "unexpected device id {:#04x}, expected {:#04x}", id, DEVICE_ID)
            }
            Error::Timeout => f.write_str("timed out waiting for the sensor"),
            Error::InvalidArgument => f.write_str("value out of range for register"),
        }
    }
}

/// Data ready flags from the STATUS register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Status {
    /// A new temperature sample is available.
    pub temperature_ready: bool,
    /// A new pressure or altitude sample is available.
    pub pressure_ready: bool,
    /// Either of the above.
    pub any_ready: bool,
}

impl From<u8> for Status {
    fn from(byte: u8) -> Self {
        Status {
            temperature_ready: byte & STATUS_TDR != 0,
            pressure_ready: byte & STATUS_PDR != 0,
            any_ready: byte & STATUS_PTDR != 0,
        }
    }
}

/// Convert the OUT_T register pair to degrees Celsius.
///
/// The value is signed Q8.4 left aligned in 16 bits, so one LSB of the
/// assembled word is 1/256 °C.
pub fn temperature_from_raw(raw: [u8; 2]) -> f32 {
    i16::from_be_bytes(raw) as f32 / 256.0
}

/// Convert the OUT_P registers, read in barometer mode, to pascals.
///
/// The value is unsigned Q18.2 left aligned in 24 bits, so one LSB of the
/// assembled word is 1/64 Pa.
pub fn pressure_from_raw(raw: [u8; 3]) -> f32 {
    let [msb, csb, lsb] = raw.map(u32::from);
    ((msb << 16) | (csb << 8) | lsb) as f32 / 64.0
}

/// Convert the OUT_P registers, read in altimeter mode, to metres.
///
/// The three bytes are the top of a signed Q16.16 word whose low byte is
/// always zero.
pub fn altitude_from_raw(raw: [u8; 3]) -> f32 {
    let [msb, csb, lsb] = raw;
    i32::from_be_bytes([msb, csb, lsb, 0]) as f32 / 65536.0
}

/// Encode a sea level pressure in pascals as the BAR_IN register value,
/// which counts in units of 2 Pa. Fractions are truncated.
///
/// Returns `None` for values the register cannot hold: anything negative,
/// not finite or above [MAX_SEA_PRESSURE].
pub fn sea_pressure_to_raw(pascals: f32) -> Option<u16> {
    if !pascals.is_finite() || !(0.0..=MAX_SEA_PRESSURE).contains(&pascals) {
        return None;
    }
    Some((pascals / 2.0) as u16)
}

/// The MPL3115A2 sensor.
///
/// Generic over the I2C bus and the delay used between polls. The driver
/// keeps track of the acquisition mode last written to the device so a
/// read only switches modes when it has to.
#[derive(Debug)]
pub struct Mpl3115a2<'a, I2C, D>
where
    I2C: Write + WriteRead,
    D: DelayMs<u32>,
{
    i2c: &'a mut I2C,
    delay: D,
    config: Config,
    mode: Mode,
}

impl<'a, I2C, D, E> Mpl3115a2<'a, I2C, D>
where
    I2C: Write<Error = E> + WriteRead<Error = E>,
    D: DelayMs<u32>,
{
    /// Create a new instance of the sensor with the default [Config].
    ///
    /// This checks the device id, resets the device and configures it with:
    /// - Oversampling: 128
    /// - Mode: altimeter
    /// - Data ready events for temperature and pressure/altitude
    pub fn new(i2c: &'a mut I2C, delay: D) -> Result<Self, Error<E>> {
        Self::with_config(i2c, delay, Config::default())
    }

    /// Create a new instance of the sensor with explicit poll timing.
    /// See [Mpl3115a2::new].
    pub fn with_config(i2c: &'a mut I2C, delay: D, config: Config) -> Result<Self, Error<E>> {
        let mut sensor = Mpl3115a2 {
            i2c,
            delay,
            config,
            mode: Mode::Altimeter,
        };
        let id = sensor.sensor_id()?;
        if id != DEVICE_ID {
            error!("MPL3115A2 not found, WHO_AM_I returned {:#04x}", id);
            return Err(Error::UnexpectedDevice(id));
        }
        sensor.init()?;
        debug!("MPL3115A2 initialised");
        Ok(sensor)
    }

    fn init(&mut self) -> Result<(), Error<E>> {
        self.write(&[CTRL_REG1, CTRL_REG1_RST])?;
        // RST reads back as set until the device has finished rebooting
        self.poll(CTRL_REG1, CTRL_REG1_RST, false)?;

        self.write(&[
            CTRL_REG1,
            Mode::Altimeter.apply(Oversampling::OneTwentyEight.bits()),
        ])?;
        self.mode = Mode::Altimeter;

        self.write(&[
            PT_DATA_CFG,
            PT_DATA_CFG_TDEFE | PT_DATA_CFG_PDEFE | PT_DATA_CFG_DREM,
        ])
    }

    /// Hand back the delay provider. The I2C bus is released with the borrow.
    pub fn release(self) -> D {
        self.delay
    }

    /// Content of the WHO_AM_I register, [DEVICE_ID] for a genuine part.
    pub fn sensor_id(&mut self) -> Result<u8, Error<E>> {
        self.read8(WHO_AM_I)
    }

    /// Reset the sensor and configure it the same way as [Mpl3115a2::new].
    ///
    /// Sea level pressure and altitude offset go back to their power-on
    /// values and the mode returns to [Mode::Altimeter].
    pub fn soft_reset(&mut self) -> Result<(), Error<E>> {
        self.init()?;
        debug!("MPL3115A2 reset");
        Ok(())
    }

    /// The mode last written to the device.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Poll timing in use.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Switch the acquisition mode. Only the mode bit of CTRL_REG1 changes.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error<E>> {
        let ctrl = self.read8(CTRL_REG1)?;
        self.write(&[CTRL_REG1, mode.apply(ctrl)])?;
        self.mode = mode;
        debug!("MPL3115A2 switched to {:?} mode", mode);
        Ok(())
    }

    /// Change the oversampling ratio used by later readings. The mode is kept.
    pub fn set_oversampling(&mut self, oversampling: Oversampling) -> Result<(), Error<E>> {
        let ctrl = self.read8(CTRL_REG1)? & !CTRL_REG1_OS_MASK;
        self.write(&[CTRL_REG1, ctrl | oversampling.bits()])
    }

    /// Data ready flags. Reading the output registers clears them.
    pub fn data_ready_status(&mut self) -> Result<Status, Error<E>> {
        Ok(Status::from(self.read8(STATUS)?))
    }

    /// Take a temperature reading in degrees Celsius. Works in either mode.
    pub fn read_temperature(&mut self) -> Result<f32, Error<E>> {
        let mut buffer = [0; 2];
        self.one_shot(STATUS_TDR, OUT_T_MSB, &mut buffer)?;
        Ok(temperature_from_raw(buffer))
    }

    /// Take a pressure reading in pascals, switching to barometer mode first
    /// if needed.
    pub fn read_pressure(&mut self) -> Result<f32, Error<E>> {
        self.ensure_mode(Mode::Barometer)?;
        let mut buffer = [0; 3];
        self.one_shot(STATUS_PDR, OUT_P_MSB, &mut buffer)?;
        Ok(pressure_from_raw(buffer))
    }

    /// Take an altitude reading in metres, switching to altimeter mode first
    /// if needed.
    ///
    /// The device computes altitude from the sea level pressure set with
    /// [Mpl3115a2::set_sea_pressure] and adds the altitude offset.
    pub fn read_altitude(&mut self) -> Result<f32, Error<E>> {
        self.ensure_mode(Mode::Altimeter)?;
        let mut buffer = [0; 3];
        self.one_shot(STATUS_PDR, OUT_P_MSB, &mut buffer)?;
        Ok(altitude_from_raw(buffer))
    }

    /// Set the sea level pressure in pascals used for altitude readings.
    /// The power-on value is 101326 Pa.
    ///
    /// The register has a resolution of 2 Pa, so odd values are rounded
    /// down. Values outside `0.0..=MAX_SEA_PRESSURE` return
    /// [Error::InvalidArgument] without touching the bus.
    pub fn set_sea_pressure(&mut self, pascals: f32) -> Result<(), Error<E>> {
        let [msb, lsb] = sea_pressure_to_raw(pascals)
            .ok_or(Error::InvalidArgument)?
            .to_be_bytes();
        self.write(&[BAR_IN_MSB, msb, lsb])
    }

    /// Set the altitude offset in metres added to every altitude reading.
    ///
    /// The OFF_H register is a two's complement byte, so the whole `i8`
    /// range is accepted.
    pub fn set_altitude_offset(&mut self, offset: i8) -> Result<(), Error<E>> {
        self.write(&[OFF_H, offset as u8])
    }

    fn ensure_mode(&mut self, mode: Mode) -> Result<(), Error<E>> {
        if self.mode != mode {
            self.set_mode(mode)?;
        }
        Ok(())
    }

    /// Trigger a single conversion, wait for `ready` in STATUS and for the
    /// device to drop OST, then read the output registers from `register`.
    fn one_shot(&mut self, ready: u8, register: u8, buffer: &mut [u8]) -> Result<(), Error<E>> {
        let ctrl = self.poll(CTRL_REG1, CTRL_REG1_OST, false)?;
        trace!("MPL3115A2 one-shot triggered");
        self.write(&[CTRL_REG1, ctrl | CTRL_REG1_OST])?;
        self.poll(STATUS, ready, true)?;
        // a ready flag may be left over from an earlier conversion; OST is
        // only cleared once this one has finished
        self.poll(CTRL_REG1, CTRL_REG1_OST, false)?;
        self.read(register, buffer)
    }

    /// Read `reg` until `mask` is set (`set == true`) or clear, sleeping
    /// between reads. Returns the last value read.
    fn poll(&mut self, reg: u8, mask: u8, set: bool) -> Result<u8, Error<E>> {
        let attempts = self.config.max_polls.max(1);
        for attempt in 1..=attempts {
            let value = self.read8(reg)?;
            if (value & mask != 0) == set {
                return Ok(value);
            }
            if attempt < attempts {
                self.delay.delay_ms(self.config.poll_interval_ms);
            }
        }
        warn!(
            "MPL3115A2 register {:#04x} bit {:#04x} not {} after {} polls",
            reg,
            mask,
            if set { "set" } else { "clear" },
            attempts
        );
        Err(Error::Timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        self.i2c.write(ADDR, data).map_err(Error::Bus)
    }

    fn read(&mut self, reg: u8, buffer: &mut [u8]) -> Result<(), Error<E>> {
        self.i2c.write_read(ADDR, &[reg], buffer).map_err(Error::Bus)
    }

    fn read8(&mut self, reg: u8) -> Result<u8, Error<E>> {
        let mut buffer = [0u8];
        self.read(reg, &mut buffer)?;
        Ok(buffer[0])
    }
}
