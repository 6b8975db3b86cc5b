use anyhow::Context;
use breakout_bot::api::{BinanceClient, MarketDataSource};
use breakout_bot::execution::{
    stream_url, CandleBuffer, FeedEvent, MarketFeed, StreamConfig, BINANCE_WS_BASE,
};
use breakout_bot::indicators::highest_high;
use breakout_bot::models::{Candle, Instrument, Timeframe};
use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";
const CLEAR: &str = "\x1b[H\x1b[J";

#[derive(Parser, Debug)]
#[command(name = "candles")]
#[command(about = "ASCII candlestick chart from Binance klines")]
struct Args {
    #[arg(long, default_value = "BTC/USDT")]
    symbol: String,

    #[arg(long, default_value = "1h")]
    timeframe: String,

    #[arg(long, default_value = "120")]
    limit: usize,

    /// Chart rows
    #[arg(long, default_value = "24")]
    height: usize,

    /// Overlay the rolling N-candle high
    #[arg(long, default_value = "20")]
    breakout: usize,

    /// Keep streaming and redraw on every closed candle
    #[arg(long)]
    follow: bool,
}

/// Row index for `value`, 0 at the bottom
fn scale(value: f64, min: f64, max: f64, rows: usize) -> usize {
    if max - min < 1e-12 || rows == 0 {
        return 0;
    }
    let y = ((value - min) / (max - min) * (rows - 1) as f64) as isize;
    y.clamp(0, rows as isize - 1) as usize
}

/// Candlestick grid, top row first; the last column may be the forming candle
fn render_chart(candles: &[Candle], height: usize, breakout: usize, color: bool) -> Vec<String> {
    if candles.len() < 2 || height == 0 {
        return vec!["waiting for candles...".to_string()];
    }

    let mut min = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let mut max = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let pad = if max > min { (max - min) * 0.02 } else { 1.0 };
    min -= pad;
    max += pad;

    let mut grid = vec![vec![' '; candles.len()]; height];
    for (x, c) in candles.iter().enumerate() {
        for y in scale(c.low, min, max, height)..=scale(c.high, min, max, height) {
            grid[height - 1 - y][x] = '│';
        }
        let (lo, hi) = if c.open <= c.close {
            (c.open, c.close)
        } else {
            (c.close, c.open)
        };
        for y in scale(lo, min, max, height)..=scale(hi, min, max, height) {
            grid[height - 1 - y][x] = '█';
        }

        // Level the candle at x had to close above
        if breakout > 0 && x > breakout {
            if let Some(hh) = highest_high(&candles[..=x], breakout) {
                let row = height - 1 - scale(hh, min, max, height);
                if grid[row][x] == ' ' {
                    grid[row][x] = '·';
                }
            }
        }
    }

    let first = &candles[0];
    let last = &candles[candles.len() - 1];
    let change = if first.close != 0.0 {
        (last.close - first.close) / first.close * 100.0
    } else {
        0.0
    };

    let mut lines = vec![format!(
        "last={:.2}  change={:+.2}%  range=[{:.2} .. {:.2}]",
        last.close, change, min, max
    )];
    for row in &grid {
        let line: String = row
            .iter()
            .zip(candles)
            .map(|(ch, c)| match ch {
                '█' | '│' if color => {
                    let col = if c.close >= c.open { GREEN } else { RED };
                    format!("{}{}{}", col, ch, RESET)
                }
                _ => ch.to_string(),
            })
            .collect();
        lines.push(line);
    }
    lines.push(format!(
        "{}  ..  {}",
        first.open_time.format("%Y-%m-%d %H:%M"),
        last.open_time.format("%Y-%m-%d %H:%M")
    ));
    lines
}

fn draw(instrument: &Instrument, timeframe: Timeframe, candles: &[Candle], args: &Args, clear: bool) {
    let color = std::io::stdout().is_terminal();
    if clear {
        print!("{}", CLEAR);
    }
    println!("{} {}", instrument, timeframe.as_str());
    for line in render_chart(candles, args.height, args.breakout, color) {
        println!("{}", line);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("breakout_bot=warn")
        .init();

    let args = Args::parse();
    let instrument: Instrument = args
        .symbol
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid --symbol")?;
    let timeframe: Timeframe = args
        .timeframe
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid --timeframe")?;

    let client = BinanceClient::new(false, Duration::from_secs(10), None)?;
    let history = client
        .fetch_history(&instrument, timeframe, args.limit)
        .await
        .with_context(|| format!("Failed to fetch klines for {}", instrument))?;

    if !args.follow {
        draw(&instrument, timeframe, &history, &args, false);
        return Ok(());
    }

    let buffer = CandleBuffer::new(args.limit.max(2));
    buffer
        .replace_history(&instrument, &history)
        .map_err(|e| anyhow::anyhow!(e))?;
    draw(&instrument, timeframe, &history, &args, true);

    let source: Arc<dyn MarketDataSource> = Arc::new(client);
    let mut feed = MarketFeed::new(source, Duration::from_secs(120));
    let mut events = feed.subscribe(StreamConfig {
        url: stream_url(BINANCE_WS_BASE, std::slice::from_ref(&instrument), timeframe),
        instruments: vec![instrument.clone()],
        reconnect_delay: Duration::from_secs(2),
    });

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    FeedEvent::KlineClosed { instrument: i, candle } => {
                        if buffer.apply_kline(&i, candle, true).map_err(|e| anyhow::anyhow!(e))? {
                            let candles = buffer
                                .candles_with_forming(&i)
                                .map_err(|e| anyhow::anyhow!(e))?;
                            draw(&i, timeframe, &candles, &args, true);
                        }
                    }
                    FeedEvent::KlineForming { instrument: i, candle } => {
                        buffer.apply_kline(&i, candle, false).map_err(|e| anyhow::anyhow!(e))?;
                    }
                    FeedEvent::Resubscribed => {
                        let candles = feed.fetch_history(&instrument, timeframe, args.limit).await?;
                        buffer.replace_history(&instrument, &candles).map_err(|e| anyhow::anyhow!(e))?;
                    }
                    FeedEvent::Ticker { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    feed.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn candle(i: i64, open: f64, close: f64) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(i);
        Candle {
            open_time,
            close_time: open_time + ChronoDuration::hours(1) - ChronoDuration::milliseconds(1),
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_scale_bounds() {
        assert_eq!(scale(0.0, 0.0, 10.0, 5), 0);
        assert_eq!(scale(10.0, 0.0, 10.0, 5), 4);
        assert_eq!(scale(50.0, 0.0, 10.0, 5), 4);
        assert_eq!(scale(5.0, 5.0, 5.0, 5), 0);
    }

    #[test]
    fn test_render_dimensions() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(i, 100.0 + i as f64, 101.0 + i as f64))
            .collect();

        let lines = render_chart(&candles, 10, 20, false);

        // header + rows + footer
        assert_eq!(lines.len(), 12);
        assert!(lines[0].starts_with("last=130.00"));
        assert!(lines[1..11].iter().all(|l| l.chars().count() == 30));
        assert!(lines.iter().any(|l| l.contains('█')));
    }

    #[test]
    fn test_render_needs_two_candles() {
        let lines = render_chart(&[candle(0, 1.0, 2.0)], 10, 20, false);
        assert_eq!(lines, vec!["waiting for candles...".to_string()]);
    }
}
